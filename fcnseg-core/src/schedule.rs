use burn::{lr_scheduler::LrScheduler, prelude::*, LearningRate};

/// Inverse-time decay: `initial_lr / (1 + decay * iteration)`.
#[derive(Config, Debug)]
pub struct InverseTimeDecayConfig {
    initial_lr: LearningRate,
    #[config(default = 2e-5)]
    decay: f64,
}

impl InverseTimeDecayConfig {
    pub fn init(&self) -> InverseTimeDecay {
        assert!(
            self.initial_lr > 0.0,
            "initial learning rate must be greater than 0"
        );
        assert!(self.decay >= 0.0, "decay must not be negative");
        InverseTimeDecay {
            initial_lr: self.initial_lr,
            decay: self.decay,
            iteration: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InverseTimeDecay {
    initial_lr: LearningRate,
    decay: f64,
    iteration: usize,
}

impl<B: Backend> LrScheduler<B> for InverseTimeDecay {
    type Record = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.initial_lr / (1.0 + self.decay * self.iteration as f64);
        self.iteration += 1;
        lr
    }

    fn to_record(&self) -> Self::Record {
        self.iteration
    }

    fn load_record(mut self, record: Self::Record) -> Self {
        self.iteration = record;
        self
    }
}
