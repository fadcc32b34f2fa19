use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use std::io::Read;
use std::io::Write;

/// a dense parameter blob with plain SGD. learners treat their models
/// as opaque; this is the smallest thing that trains, saves, and loads.
#[derive(Debug, Clone, PartialEq)]
pub struct Network {
    shape: Vec<usize>,
    weights: Vec<Vec<f32>>,
    biases: Vec<Vec<f32>>,
}

impl Network {
    /// he-style initialization, hidden relu, linear output
    pub fn new(shape: &[usize], rng: &mut impl rand::Rng) -> Self {
        assert!(shape.len() >= 2);
        let mut weights = Vec::new();
        let mut biases = Vec::new();
        for pair in shape.windows(2) {
            let (inputs, outputs) = (pair[0], pair[1]);
            let scale = (2. / inputs as f32).sqrt();
            weights.push(
                (0..inputs * outputs)
                    .map(|_| (rng.random::<f32>() * 2. - 1.) * scale)
                    .collect(),
            );
            biases.push(vec![0.; outputs]);
        }
        Self {
            shape: shape.to_vec(),
            weights,
            biases,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
    pub fn inputs(&self) -> usize {
        self.shape[0]
    }
    pub fn outputs(&self) -> usize {
        *self.shape.last().expect("nonempty shape")
    }
    pub fn parameters(&self) -> usize {
        self.weights.iter().map(Vec::len).sum::<usize>()
            + self.biases.iter().map(Vec::len).sum::<usize>()
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        self.activations(input)
            .pop()
            .expect("at least the output layer")
    }

    /// post-activation values per layer, input first
    fn activations(&self, input: &[f32]) -> Vec<Vec<f32>> {
        assert!(input.len() == self.inputs());
        let mut activations = vec![input.to_vec()];
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let x = activations.last().expect("seeded with input");
            let mut z = self.affine(l, w, b, x);
            if l + 1 < self.weights.len() {
                for v in z.iter_mut() {
                    *v = v.max(0.);
                }
            }
            activations.push(z);
        }
        activations
    }

    fn affine(&self, layer: usize, w: &[f32], b: &[f32], x: &[f32]) -> Vec<f32> {
        let inputs = self.shape[layer];
        let outputs = self.shape[layer + 1];
        let mut z = b.to_vec();
        for o in 0..outputs {
            let row = &w[o * inputs..(o + 1) * inputs];
            z[o] += row.iter().zip(x.iter()).map(|(w, x)| w * x).sum::<f32>();
        }
        z
    }

    /// one SGD step against the gradient of the loss with respect to
    /// the network output
    pub fn backward(&mut self, input: &[f32], grad_out: &[f32], lr: f32) {
        let activations = self.activations(input);
        let mut delta = grad_out.to_vec();
        for l in (0..self.weights.len()).rev() {
            let inputs = self.shape[l];
            let outputs = self.shape[l + 1];
            // relu gate on hidden layers: dead units pass no gradient
            if l + 1 < self.weights.len() {
                for (d, a) in delta.iter_mut().zip(activations[l + 1].iter()) {
                    if *a <= 0. {
                        *d = 0.;
                    }
                }
            }
            let upstream = if l > 0 {
                let mut up = vec![0.; inputs];
                for o in 0..outputs {
                    let row = &self.weights[l][o * inputs..(o + 1) * inputs];
                    for (u, w) in up.iter_mut().zip(row.iter()) {
                        *u += w * delta[o];
                    }
                }
                Some(up)
            } else {
                None
            };
            let x = &activations[l];
            for o in 0..outputs {
                let row = &mut self.weights[l][o * inputs..(o + 1) * inputs];
                for (w, xi) in row.iter_mut().zip(x.iter()) {
                    *w -= lr * delta[o] * xi;
                }
                self.biases[l][o] -= lr * delta[o];
            }
            if let Some(up) = upstream {
                delta = up;
            }
        }
    }

    /// soft update toward another network of the same shape
    pub fn blend(&mut self, other: &Self, tau: f32) {
        assert!(self.shape == other.shape);
        for (a, b) in self.weights.iter_mut().zip(other.weights.iter()) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x = *x * (1. - tau) + y * tau;
            }
        }
        for (a, b) in self.biases.iter_mut().zip(other.biases.iter()) {
            for (x, y) in a.iter_mut().zip(b.iter()) {
                *x = *x * (1. - tau) + y * tau;
            }
        }
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.blend(other, 1.);
    }

    /// gaussian parameter noise, for evolutionary and refinement loops
    pub fn perturb(&mut self, sigma: f32, rng: &mut impl rand::Rng) {
        for w in self.weights.iter_mut().flatten() {
            *w += gaussian(rng) * sigma;
        }
        for b in self.biases.iter_mut().flatten() {
            *b += gaussian(rng) * sigma;
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_u16::<BE>(self.shape.len() as u16)?;
        for dim in &self.shape {
            w.write_u32::<BE>(*dim as u32)?;
        }
        for layer in self.weights.iter().chain(self.biases.iter()) {
            for value in layer {
                w.write_f32::<BE>(*value)?;
            }
        }
        Ok(())
    }

    pub fn load(r: &mut dyn Read) -> std::io::Result<Self> {
        let dims = r.read_u16::<BE>()? as usize;
        if dims < 2 || dims > 16 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("implausible layer count {}", dims),
            ));
        }
        let mut shape = Vec::with_capacity(dims);
        for _ in 0..dims {
            shape.push(r.read_u32::<BE>()? as usize);
        }
        let mut network = Self {
            weights: shape
                .windows(2)
                .map(|p| vec![0.; p[0] * p[1]])
                .collect(),
            biases: shape.windows(2).map(|p| vec![0.; p[1]]).collect(),
            shape,
        };
        for layer in network.weights.iter_mut().chain(network.biases.iter_mut()) {
            for value in layer.iter_mut() {
                *value = r.read_f32::<BE>()?;
            }
        }
        Ok(network)
    }
}

/// box-muller, good enough for parameter noise
pub fn gaussian(rng: &mut impl rand::Rng) -> f32 {
    let u = rng.random::<f32>().max(1e-9);
    let v = rng.random::<f32>();
    (-2. * u.ln()).sqrt() * (2. * std::f32::consts::PI * v).cos()
}

pub fn softmax(xs: &[f32]) -> Vec<f32> {
    let max = xs.iter().copied().fold(f32::MIN, f32::max);
    let exps = xs.iter().map(|x| (x - max).exp()).collect::<Vec<_>>();
    let total = exps.iter().sum::<f32>().max(1e-12);
    exps.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn is_load_inverse_save() {
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(1);
        let network = Network::new(&[8, 16, 4], rng);
        let mut buffer = Vec::new();
        network.save(&mut buffer).expect("save");
        let loaded = Network::load(&mut buffer.as_slice()).expect("load");
        assert!(loaded == network);
    }

    #[test]
    fn sgd_reduces_squared_error() {
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(2);
        let mut network = Network::new(&[2, 8, 1], rng);
        let samples = [([0., 0.], 0.), ([1., 0.], 1.), ([0., 1.], 1.), ([1., 1.], 0.5)];
        let loss = |n: &Network| {
            samples
                .iter()
                .map(|(x, y)| (n.forward(x)[0] - y).powi(2))
                .sum::<f32>()
        };
        let before = loss(&network);
        for _ in 0..500 {
            for (x, y) in &samples {
                let out = network.forward(x)[0];
                network.backward(x, &[2. * (out - y)], 0.05);
            }
        }
        assert!(loss(&network) < before);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1., 2., 3., 4.]);
        assert!((p.iter().sum::<f32>() - 1.).abs() < 1e-5);
        assert!(p.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn blend_with_tau_one_copies() {
        let ref mut rng = rand::rngs::SmallRng::seed_from_u64(3);
        let a = Network::new(&[4, 4], rng);
        let mut b = Network::new(&[4, 4], rng);
        b.copy_from(&a);
        assert!(a == b);
    }
}
