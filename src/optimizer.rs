//! Optimizer implementations (SGD with momentum, Adam).
//!
//! Both keep their per-parameter state keyed by parameter name so it can be
//! written to and restored from a checkpoint.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::config::OptimizerKind;
use crate::error::{FusionError, Result};

/// Gradient-descent optimizer over a fixed, named parameter list.
pub trait Optimizer {
    /// Apply one update from already computed gradients.
    ///
    /// Parameters without a gradient (for example batch-norm running
    /// statistics) are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    /// Backpropagate `loss` and apply one update.
    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Current learning rate.
    fn learning_rate(&self) -> f64;

    /// Set the learning rate (used by the scheduler).
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far.
    fn step_count(&self) -> usize;

    /// Internal state as `<slot>.<parameter>` tensors.
    fn state_tensors(&self) -> BTreeMap<String, Tensor>;

    /// Restore state written by [`Optimizer::state_tensors`].
    fn load_state(&mut self, step_count: usize, tensors: &HashMap<String, Tensor>) -> Result<()>;
}

/// Build the configured optimizer over `params`.
#[must_use]
pub fn build_optimizer(
    kind: &OptimizerKind,
    learning_rate: f64,
    weight_decay: f64,
    params: Vec<(String, Var)>,
) -> Box<dyn Optimizer> {
    match *kind {
        OptimizerKind::Sgd { momentum } => Box::new(Sgd {
            params,
            learning_rate,
            momentum,
            weight_decay,
            velocity: HashMap::new(),
            t: 0,
        }),
        OptimizerKind::Adam { beta1, beta2, eps } => Box::new(Adam {
            params,
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }),
    }
}

fn decayed_grad(grad: &Tensor, param: &Tensor, weight_decay: f64) -> Result<Tensor> {
    if weight_decay == 0.0 {
        Ok(grad.clone())
    } else {
        Ok((grad + (param.detach() * weight_decay)?)?)
    }
}

fn restore_slot(
    slot: &str,
    params: &[(String, Var)],
    tensors: &HashMap<String, Tensor>,
    into: &mut HashMap<String, Tensor>,
) -> Result<()> {
    into.clear();
    for (name, var) in params {
        if let Some(t) = tensors.get(&format!("{slot}.{name}")) {
            if t.dims() != var.dims() {
                return Err(FusionError::Checkpoint(format!(
                    "optimizer state {slot}.{name} has shape {:?}, parameter has {:?}",
                    t.dims(),
                    var.dims()
                )));
            }
            into.insert(name.clone(), t.to_device(var.device())?);
        }
    }
    Ok(())
}

/// SGD with classical momentum.
pub struct Sgd {
    params: Vec<(String, Var)>,
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    /// Momentum buffers
    velocity: HashMap<String, Tensor>,
    t: usize,
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = decayed_grad(grad, var.as_tensor(), self.weight_decay)?;

            let update = if self.momentum == 0.0 {
                grad
            } else {
                // v = momentum * v + g, seeded with g
                let v = match self.velocity.get(name) {
                    Some(v) => ((v * self.momentum)? + &grad)?,
                    None => grad,
                };
                self.velocity.insert(name.clone(), v.clone());
                v
            };

            let new_w = (var.as_tensor() - (update * self.learning_rate)?)?;
            var.set(&new_w)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.t
    }

    fn state_tensors(&self) -> BTreeMap<String, Tensor> {
        self.velocity
            .iter()
            .map(|(name, v)| (format!("momentum.{name}"), v.clone()))
            .collect()
    }

    fn load_state(&mut self, step_count: usize, tensors: &HashMap<String, Tensor>) -> Result<()> {
        restore_slot("momentum", &self.params, tensors, &mut self.velocity)?;
        self.t = step_count;
        Ok(())
    }
}

/// Adam with L2 weight decay folded into the gradient.
pub struct Adam {
    params: Vec<(String, Var)>,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    /// First moment estimates
    m: HashMap<String, Tensor>,
    /// Second moment estimates
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = decayed_grad(grad, var.as_tensor(), self.weight_decay)?;

            let m_new = match self.m.get(name) {
                Some(m) => ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?,
                None => (&grad * (1.0 - self.beta1))?,
            };
            let grad_sq = grad.sqr()?;
            let v_new = match self.v.get(name) {
                Some(v) => ((v * self.beta2)? + (&grad_sq * (1.0 - self.beta2))?)?,
                None => (&grad_sq * (1.0 - self.beta2))?,
            };

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
            let new_w = (var.as_tensor() - (update * self.learning_rate)?)?;
            var.set(&new_w)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn step_count(&self) -> usize {
        self.t
    }

    fn state_tensors(&self) -> BTreeMap<String, Tensor> {
        let first = self.m.iter().map(|(n, t)| (format!("m.{n}"), t.clone()));
        let second = self.v.iter().map(|(n, t)| (format!("v.{n}"), t.clone()));
        first.chain(second).collect()
    }

    fn load_state(&mut self, step_count: usize, tensors: &HashMap<String, Tensor>) -> Result<()> {
        restore_slot("m", &self.params, tensors, &mut self.m)?;
        restore_slot("v", &self.params, tensors, &mut self.v)?;
        self.t = step_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn param(values: &[f32]) -> Vec<(String, Var)> {
        let var = Var::new(values, &Device::Cpu).unwrap();
        vec![("w".to_string(), var)]
    }

    /// loss = sum(w^2), gradient 2w
    fn quadratic_step(opt: &mut dyn Optimizer, params: &[(String, Var)]) {
        let loss = params[0].1.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
    }

    fn values(params: &[(String, Var)]) -> Vec<f32> {
        params[0].1.as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn test_sgd_plain_step() {
        let params = param(&[1.0, -2.0]);
        let mut opt = build_optimizer(&OptimizerKind::Sgd { momentum: 0.0 }, 0.1, 0.0, params.clone());
        quadratic_step(opt.as_mut(), &params);
        let w = values(&params);
        assert!((w[0] - 0.8).abs() < 1e-6);
        assert!((w[1] + 1.6).abs() < 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let params = param(&[1.0]);
        let mut opt = build_optimizer(&OptimizerKind::Sgd { momentum: 0.9 }, 0.1, 0.0, params.clone());
        quadratic_step(opt.as_mut(), &params);
        // v = 2.0, w = 1 - 0.2
        assert!((values(&params)[0] - 0.8).abs() < 1e-6);
        quadratic_step(opt.as_mut(), &params);
        // v = 0.9 * 2.0 + 1.6 = 3.4, w = 0.8 - 0.34
        assert!((values(&params)[0] - 0.46).abs() < 1e-6);
        assert!(opt.state_tensors().contains_key("momentum.w"));
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let params = param(&[3.0, -1.0]);
        let kind = OptimizerKind::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let mut opt = build_optimizer(&kind, 0.01, 0.0, params.clone());
        quadratic_step(opt.as_mut(), &params);
        let w = values(&params);
        assert!((w[0] - 2.99).abs() < 1e-5);
        assert!((w[1] + 0.99).abs() < 1e-5);

        let state = opt.state_tensors();
        assert!(state.contains_key("m.w"));
        assert!(state.contains_key("v.w"));
    }

    #[test]
    fn test_state_restore_continues_identically() {
        let kind = OptimizerKind::Sgd { momentum: 0.9 };
        let a = param(&[1.0, 2.0]);
        let mut opt_a = build_optimizer(&kind, 0.05, 1e-4, a.clone());
        quadratic_step(opt_a.as_mut(), &a);

        // fresh optimizer on a copy of the weights, fed the saved state
        let b = param(&values(&a));
        let mut opt_b = build_optimizer(&kind, 0.05, 1e-4, b.clone());
        let state: HashMap<String, Tensor> = opt_a.state_tensors().into_iter().collect();
        opt_b.load_state(opt_a.step_count(), &state).unwrap();
        assert_eq!(opt_b.step_count(), 1);

        quadratic_step(opt_a.as_mut(), &a);
        quadratic_step(opt_b.as_mut(), &b);
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_state_shape_mismatch_rejected() {
        let params = param(&[1.0, 2.0]);
        let mut opt = build_optimizer(&OptimizerKind::default(), 0.1, 0.0, params);
        let mut state = HashMap::new();
        state.insert(
            "momentum.w".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            opt.load_state(4, &state),
            Err(FusionError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_learning_rate_get_set() {
        let mut opt = build_optimizer(&OptimizerKind::default(), 0.1, 0.0, param(&[1.0]));
        assert_eq!(opt.learning_rate(), 0.1);
        opt.set_learning_rate(0.01);
        assert_eq!(opt.learning_rate(), 0.01);
    }
}
