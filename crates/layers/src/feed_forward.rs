//! Positionwise feed-forward stack built from linear and convolutional sublayers.
//!
//! The stack is described by a short layer string over `{l, c}` (`"ll"`,
//! `"cc"`, `"lcl"`, ...). It is parsed once at construction into a list of
//! [`SublayerSpec`]s: the first maps `input_depth -> filter_size`, interior
//! sublayers keep `filter_size`, and the last maps `filter_size ->
//! output_depth`. Convolutional sublayers use a width-3 kernel with the
//! configured [`PadType`].
//!
//! The activation and dropout run after every sublayer, the final one
//! included, so outputs of the default ReLU stack are never negative.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    activations::ActivationKind,
    checks,
    conv::{Conv, ConvConfig, PadType},
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    LayerError, Result, SequenceLayer,
};

/// Kernel width of convolutional sublayers.
pub const CONV_KERNEL_SIZE: usize = 3;

/// Kind of a single sublayer in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SublayerKind {
    Linear,
    Conv,
}

impl SublayerKind {
    /// Parses one character of a layer config string.
    pub fn from_char(code: char) -> Result<Self> {
        match code {
            'l' => Ok(SublayerKind::Linear),
            'c' => Ok(SublayerKind::Conv),
            other => Err(LayerError::Configuration(format!(
                "unknown layer type '{other}' (expected 'l' or 'c')"
            ))),
        }
    }

    pub fn code(&self) -> char {
        match self {
            SublayerKind::Linear => 'l',
            SublayerKind::Conv => 'c',
        }
    }
}

/// Resolved shape of one sublayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SublayerSpec {
    pub kind: SublayerKind,
    pub in_features: usize,
    pub out_features: usize,
}

fn default_layer_config() -> String {
    "ll".to_string()
}

/// Configuration of a [`PositionwiseFeedForward`] stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    pub input_depth: usize,
    pub filter_size: usize,
    pub output_depth: usize,
    /// Layer string over `{l, c}` with at least two sublayers.
    #[serde(default = "default_layer_config")]
    pub layer_config: String,
    /// Padding used by convolutional sublayers.
    #[serde(default)]
    pub padding: PadType,
    #[serde(default)]
    pub dropout_p: Option<f32>,
    #[serde(default)]
    pub activation: ActivationKind,
    /// Seed for the dropout mask generator.
    #[serde(default)]
    pub seed: u64,
}

impl FeedForwardConfig {
    /// Two linear sublayers with ReLU, causal padding, and no dropout.
    pub fn new(input_depth: usize, filter_size: usize, output_depth: usize) -> Self {
        Self {
            input_depth,
            filter_size,
            output_depth,
            layer_config: default_layer_config(),
            padding: PadType::default(),
            dropout_p: None,
            activation: ActivationKind::default(),
            seed: 0,
        }
    }

    pub fn with_layer_config(mut self, layer_config: impl Into<String>, padding: PadType) -> Self {
        self.layer_config = layer_config.into();
        self.padding = padding;
        self
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_dropout(mut self, dropout_p: f32, seed: u64) -> Self {
        self.dropout_p = Some(dropout_p);
        self.seed = seed;
        self
    }

    /// Parses the layer string into per-sublayer shapes.
    pub fn sublayer_specs(&self) -> Result<Vec<SublayerSpec>> {
        let kinds = self
            .layer_config
            .chars()
            .map(SublayerKind::from_char)
            .collect::<Result<Vec<_>>>()?;
        if kinds.len() < 2 {
            return Err(LayerError::Configuration(format!(
                "layer config '{}' must describe at least two sublayers",
                self.layer_config
            )));
        }
        let last = kinds.len() - 1;
        Ok(kinds
            .into_iter()
            .enumerate()
            .map(|(index, kind)| SublayerSpec {
                kind,
                in_features: if index == 0 {
                    self.input_depth
                } else {
                    self.filter_size
                },
                out_features: if index == last {
                    self.output_depth
                } else {
                    self.filter_size
                },
            })
            .collect())
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_depth == 0 || self.filter_size == 0 || self.output_depth == 0 {
            return Err(LayerError::Configuration(format!(
                "feed-forward depths must be positive, got {} -> {} -> {}",
                self.input_depth, self.filter_size, self.output_depth
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(LayerError::Configuration(format!(
                    "dropout_p must be in [0, 1), got {p}"
                )));
            }
        }
        self.sublayer_specs().map(|_| ())
    }
}

/// A built sublayer of the stack.
#[derive(Debug, Clone)]
pub enum Sublayer {
    Linear(Linear),
    Conv(Conv),
}

impl Sublayer {
    fn build(spec: &SublayerSpec, padding: PadType, device: &Device, dtype: DType) -> Result<Self> {
        // Uniform in +-1/sqrt(fan_in).
        let init = LinearInit::KaimingUniform {
            negative_slope: 5.0f64.sqrt(),
        };
        match spec.kind {
            SublayerKind::Linear => Ok(Sublayer::Linear(Linear::with_init(
                LinearConfig::new(spec.in_features, spec.out_features),
                &init,
                device,
                dtype,
            )?)),
            SublayerKind::Conv => Ok(Sublayer::Conv(Conv::with_init(
                ConvConfig::new(spec.in_features, spec.out_features, CONV_KERNEL_SIZE, padding),
                &init,
                device,
                dtype,
            )?)),
        }
    }

    pub fn kind(&self) -> SublayerKind {
        match self {
            Sublayer::Linear(_) => SublayerKind::Linear,
            Sublayer::Conv(_) => SublayerKind::Conv,
        }
    }

    fn layer(&self) -> &dyn SequenceLayer {
        match self {
            Sublayer::Linear(linear) => linear as &dyn SequenceLayer,
            Sublayer::Conv(conv) => conv as &dyn SequenceLayer,
        }
    }
}

impl SequenceLayer for Sublayer {
    fn input_dim(&self) -> usize {
        self.layer().input_dim()
    }

    fn output_dim(&self) -> usize {
        self.layer().output_dim()
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.layer().forward(hidden, policy)
    }
}

/// Stack of linear/convolutional sublayers applied to every sequence position.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    config: FeedForwardConfig,
    sublayers: Vec<Sublayer>,
    dropout: Dropout,
    policy: PrecisionPolicy,
}

impl PositionwiseFeedForward {
    /// Builds the stack with randomly initialised parameters.
    pub fn new(config: FeedForwardConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let specs = config.sublayer_specs()?;
        let sublayers = specs
            .iter()
            .map(|spec| Sublayer::build(spec, config.padding, device, dtype))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "feed-forward init: layers={} dims={}->{}->{} padding={:?} activation={:?} dropout={:?}",
            config.layer_config,
            config.input_depth,
            config.filter_size,
            config.output_depth,
            config.padding,
            config.activation,
            config.dropout_p
        );
        Self::from_sublayers(config, sublayers, dtype)
    }

    /// Assembles the stack from pre-built sublayers, checking them against the
    /// shapes derived from `config`.
    pub fn from_sublayers(
        config: FeedForwardConfig,
        sublayers: Vec<Sublayer>,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let specs = config.sublayer_specs()?;
        if specs.len() != sublayers.len() {
            return Err(LayerError::Configuration(format!(
                "layer config '{}' needs {} sublayers, got {}",
                config.layer_config,
                specs.len(),
                sublayers.len()
            )));
        }
        for (index, (spec, layer)) in specs.iter().zip(&sublayers).enumerate() {
            if layer.kind() != spec.kind
                || layer.input_dim() != spec.in_features
                || layer.output_dim() != spec.out_features
            {
                return Err(LayerError::Configuration(format!(
                    "sublayer {index} does not match spec {spec:?}"
                )));
            }
        }
        let dropout = Dropout::new(config.dropout_p, config.seed)?;
        Ok(Self {
            config,
            sublayers,
            dropout,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn sublayers(&self) -> &[Sublayer] {
        &self.sublayers
    }

    /// Switches dropout between training and evaluation behaviour.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Transforms `(batch, seq, input_depth)` into `(batch, seq, output_depth)`.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("feed_forward.input", inputs, self.config.input_depth)?;
        let mut hidden = inputs.clone();
        for sublayer in &self.sublayers {
            hidden = sublayer.forward(&hidden, &self.policy)?;
            hidden = self.config.activation.apply(&hidden, &self.policy)?;
            hidden = self.dropout.forward(&hidden, &self.policy)?;
        }
        Ok(hidden)
    }
}
