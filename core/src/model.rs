/// Statically typed layer tree.
///
/// `Layer` is the closed set of layer kinds a model can contain. Containers
/// (`Sequential`) hold named children, which gives every tensor a dotted
/// path (`"0.weight"`, `"features.2.popup_scores"`) in the state dict.

use crate::checkpoint::StateDict;
use crate::conv2d::{Conv2dSubnet, DenseConv2d};
use crate::error::{Result, SubnetError};
use crate::linear::{DenseLinear, LinearSubnet};
use crate::params::Trainable;
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;
use crate::traced;

#[derive(Clone, Debug)]
pub enum Layer {
    Linear(DenseLinear),
    Conv2d(DenseConv2d),
    LinearSubnet(LinearSubnet),
    Conv2dSubnet(Conv2dSubnet),
    Relu,
    /// Collapse every dim after the first: [N, ..] → [N, prod(..)].
    Flatten,
    Sequential(Sequential),
}

/// Ordered named children, run first to last.
#[derive(Clone, Debug, Default)]
pub struct Sequential {
    children: Vec<(String, Layer)>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential::default()
    }

    /// Children named "0", "1", .. in order.
    pub fn from_layers(layers: impl IntoIterator<Item = Layer>) -> Self {
        let children = layers.into_iter().enumerate().map(|(i, l)| (i.to_string(), l)).collect();
        Sequential { children }
    }

    pub fn push(&mut self, name: impl Into<String>, layer: Layer) {
        self.children.push((name.into(), layer));
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.children.iter().map(|(n, l)| (n.as_str(), l))
    }

    pub fn children_mut(&mut self) -> impl Iterator<Item = (&str, &mut Layer)> {
        self.children.iter_mut().map(|(n, l)| (n.as_str(), l))
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }
}

fn flatten_shape(shape: &[usize]) -> Result<Vec<usize>> {
    match shape.split_first() {
        Some((&n, rest)) => Ok(vec![n, rest.iter().product()]),
        None => Err(SubnetError::InvalidShape { shape: shape.to_vec(), reason: "cannot flatten a scalar".into() }),
    }
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "Linear",
            Layer::Conv2d(_) => "Conv2d",
            Layer::LinearSubnet(_) => "LinearSubnet",
            Layer::Conv2dSubnet(_) => "Conv2dSubnet",
            Layer::Relu => "Relu",
            Layer::Flatten => "Flatten",
            Layer::Sequential(_) => "Sequential",
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Linear(l) => l.forward(x),
            Layer::Conv2d(c) => c.forward(x),
            Layer::LinearSubnet(l) => l.forward(x),
            Layer::Conv2dSubnet(c) => c.forward(x),
            Layer::Relu => {
                let data = x.data.iter().map(|v| v.max(0.0)).collect();
                Tensor::from_vec(data, &x.shape)
            }
            Layer::Flatten => Tensor::from_vec(x.data.clone(), &flatten_shape(&x.shape)?),
            Layer::Sequential(seq) => {
                let mut h = x.clone();
                for (_, child) in &seq.children {
                    h = child.forward(&h)?;
                }
                Ok(h)
            }
        }
    }

    pub fn forward_traced(&self, tape: &mut Tape, x: BufId) -> Result<BufId> {
        match self {
            Layer::Linear(l) => l.forward_traced(tape, x),
            Layer::Conv2d(c) => c.forward_traced(tape, x),
            Layer::LinearSubnet(l) => l.forward_traced(tape, x),
            Layer::Conv2dSubnet(c) => c.forward_traced(tape, x),
            Layer::Relu => Ok(traced::traced_relu(tape, x)),
            Layer::Flatten => {
                let shape = flatten_shape(tape.buf_shape(x))?;
                Ok(traced::traced_reshape(tape, x, shape))
            }
            Layer::Sequential(seq) => {
                let mut h = x;
                for (_, child) in &seq.children {
                    h = child.forward_traced(tape, h)?;
                }
                Ok(h)
            }
        }
    }

    /// Every trainable tensor in the tree, depth first.
    pub fn trainable_params_mut(&mut self) -> Vec<&mut Trainable> {
        match self {
            Layer::Linear(l) => l.trainable_params_mut(),
            Layer::Conv2d(c) => c.trainable_params_mut(),
            Layer::LinearSubnet(l) => l.trainable_params_mut(),
            Layer::Conv2dSubnet(c) => c.trainable_params_mut(),
            Layer::Relu | Layer::Flatten => Vec::new(),
            Layer::Sequential(seq) => seq
                .children
                .iter_mut()
                .flat_map(|(_, child)| child.trainable_params_mut())
                .collect(),
        }
    }

    pub fn state_dict(&self) -> StateDict {
        match self {
            Layer::Linear(l) => l.state_dict(),
            Layer::Conv2d(c) => c.state_dict(),
            Layer::LinearSubnet(l) => l.state_dict(),
            Layer::Conv2dSubnet(c) => c.state_dict(),
            Layer::Relu | Layer::Flatten => StateDict::new(),
            Layer::Sequential(seq) => {
                let mut sd = StateDict::new();
                for (name, child) in &seq.children {
                    sd.extend_prefixed(name, child.state_dict());
                }
                sd
            }
        }
    }

    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        match self {
            Layer::Linear(l) => l.load_state_dict(sd),
            Layer::Conv2d(c) => c.load_state_dict(sd),
            Layer::LinearSubnet(l) => l.load_state_dict(sd),
            Layer::Conv2dSubnet(c) => c.load_state_dict(sd),
            Layer::Relu | Layer::Flatten => Ok(()),
            Layer::Sequential(seq) => {
                for (name, child) in &mut seq.children {
                    child.load_state_dict(&sd.scoped(name))?;
                }
                Ok(())
            }
        }
    }
}

impl From<Sequential> for Layer {
    fn from(seq: Sequential) -> Self {
        Layer::Sequential(seq)
    }
}
