use crate::traits::{DynamicalSystem, Scalar, Steppable};

fn zeros<T: Scalar>(dim: usize) -> Vec<T> {
    vec![T::zero(); dim]
}

/// Writes `base + dt * Σ coeff_i * k_i` into `out`.
fn combine<T: Scalar>(out: &mut [T], base: &[T], dt: T, terms: &[(T, &[T])]) {
    for (i, slot) in out.iter_mut().enumerate() {
        let mut incr = T::zero();
        for (coeff, k) in terms {
            incr = incr + *coeff * k[i];
        }
        *slot = base[i] + dt * incr;
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: zeros(dim),
            k2: zeros(dim),
            k3: zeros(dim),
            k4: zeros(dim),
            tmp: zeros(dim),
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn dimension(&self) -> usize {
        self.tmp.len()
    }

    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let half = T::lift(0.5);
        let one = T::one();
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        combine(&mut self.tmp, state, dt, &[(half, self.k1.as_slice())]);
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        combine(&mut self.tmp, state, dt, &[(half, self.k2.as_slice())]);
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        combine(&mut self.tmp, state, dt, &[(one, self.k3.as_slice())]);
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        let sixth = T::lift(1.0 / 6.0);
        let third = T::lift(1.0 / 3.0);
        combine(
            &mut self.tmp,
            state,
            dt,
            &[
                (sixth, self.k1.as_slice()),
                (third, self.k2.as_slice()),
                (third, self.k3.as_slice()),
                (sixth, self.k4.as_slice()),
            ],
        );
        state.copy_from_slice(&self.tmp);

        *t = t0 + dt;
    }
}

/// Tsitouras 5/4 Solver (fixed step, 5th order weights)
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 6],
    tmp: Vec<T>,
}

const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];

const TSIT5_A: [&[f64]; 6] = [
    &[],
    &[0.161],
    &[-0.008480655492356989, 0.335480655492357],
    &[2.898, -6.359447987781783, 4.361447987781783],
    &[
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
    ],
    &[
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
    ],
];

const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436099,
    2.324710524099774,
];

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| zeros(dim)),
            tmp: zeros(dim),
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn dimension(&self) -> usize {
        self.tmp.len()
    }

    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;

        for stage in 0..6 {
            let (done, rest) = self.k.split_at_mut(stage);
            let terms: Vec<(T, &[T])> = TSIT5_A[stage]
                .iter()
                .zip(done.iter())
                .map(|(a, k)| (T::lift(*a), k.as_slice()))
                .collect();
            combine(&mut self.tmp, state, dt, &terms);
            system.apply(t0 + T::lift(TSIT5_C[stage]) * dt, &self.tmp, &mut rest[0]);
        }

        let terms: Vec<(T, &[T])> = TSIT5_B
            .iter()
            .zip(self.k.iter())
            .map(|(b, k)| (T::lift(*b), k.as_slice()))
            .collect();
        combine(&mut self.tmp, state, dt, &terms);
        state.copy_from_slice(&self.tmp);

        *t = t0 + dt;
    }
}
