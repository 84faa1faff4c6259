use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Floating point precision the pipeline weights are loaded with.
///
/// `Auto` picks half precision on accelerators and full precision on the
/// CPU, where half precision matmuls are unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Auto,
    F16,
    F32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn resolve(self, device: &Device) -> DType {
        let dtype = match self {
            Self::Auto if device.is_cpu() => DType::F32,
            Self::Auto | Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        info!("precision {self} resolved to {dtype:?} on {device:?}");
        dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_names() {
        assert_eq!("auto".parse::<Precision>().unwrap(), Precision::Auto);
        assert_eq!("f16".parse::<Precision>().unwrap(), Precision::F16);
        assert_eq!("f32".parse::<Precision>().unwrap(), Precision::F32);
        assert!("bf16".parse::<Precision>().is_err());
    }

    #[test]
    fn displays_plain_names() {
        assert_eq!(Precision::F16.to_string(), "f16");
        assert_eq!(Precision::default().to_string(), "auto");
    }

    #[test]
    fn auto_uses_full_precision_on_cpu() {
        assert_eq!(Precision::Auto.resolve(&Device::Cpu), DType::F32);
        assert_eq!(Precision::F16.resolve(&Device::Cpu), DType::F16);
    }
}
