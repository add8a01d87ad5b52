use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Numeric type a model or probe quantity can be evaluated with.
/// Implemented by `f64` for plain evaluation and by `Dual` for forward-mode
/// time derivatives.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a constant into the scalar type (zero infinitesimal part).
    fn lift(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A continuous-time model: `dx/dt = f(t, x)`.
pub trait DynamicalSystem<T: Scalar> {
    /// Number of continuous coordinates.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current coordinates
    /// out: buffer receiving dx/dt
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

impl<T: Scalar, S: DynamicalSystem<T> + ?Sized> DynamicalSystem<T> for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        (**self).apply(t, x, out)
    }
}

/// An integrator that advances a system by one step.
pub trait Steppable<T: Scalar> {
    /// Dimension of the state vectors this stepper was sized for.
    fn dimension(&self) -> usize;

    /// Performs one step of size dt, updating `t` and `state` in place.
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}
