//! Adam optimizer and plateau-driven learning-rate decay.

use crate::layers::Param;
use nalgebra::DMatrix;
use tracing::info;

/// Adam with L2 weight decay folded into the gradient
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: i32,
    // first and second moments, positional with the parameter list
    moments: Vec<(DMatrix<f32>, DMatrix<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            step: 0,
            moments: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    /// Apply one update. `params` must come in the same order on every call.
    pub fn step(&mut self, params: Vec<&mut Param>) {
        if self.moments.is_empty() {
            self.moments = params
                .iter()
                .map(|p| {
                    let (r, c) = p.value.shape();
                    (DMatrix::zeros(r, c), DMatrix::zeros(r, c))
                })
                .collect();
        }
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step);
        let bias2 = 1.0 - self.beta2.powi(self.step);

        for (param, (first, second)) in params.into_iter().zip(self.moments.iter_mut()) {
            let Param { value, grad } = param;
            for ((w, &g), (m, v)) in value
                .iter_mut()
                .zip(grad.iter())
                .zip(first.iter_mut().zip(second.iter_mut()))
            {
                let g = g + self.weight_decay * *w;
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *w -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

/// Halves (by `factor`) the learning rate when a maximized metric stops improving
/// for more than `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f32,
    patience: usize,
    /// Relative improvement required to reset the counter
    threshold: f64,
    best: Option<f64>,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(factor: f32, patience: usize) -> Self {
        Self {
            factor,
            patience,
            threshold: 1e-4,
            best: None,
            bad_epochs: 0,
        }
    }

    /// Record this epoch's metric; returns true if the learning rate was reduced
    pub fn step(&mut self, metric: f64, optimizer: &mut Adam) -> bool {
        let improved = match self.best {
            None => true,
            Some(best) => metric > best * (1.0 + self.threshold),
        };
        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
            return false;
        }

        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            let new_lr = optimizer.learning_rate() * self.factor;
            info!(
                "Validation AUC plateaued for {} epochs, learning rate {:.2e} -> {:.2e}",
                self.bad_epochs,
                optimizer.learning_rate(),
                new_lr
            );
            optimizer.set_learning_rate(new_lr);
            self.bad_epochs = 0;
            return true;
        }
        false
    }
}
