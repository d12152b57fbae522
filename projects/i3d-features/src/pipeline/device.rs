use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// Handle for one accelerator a worker is bound to. Passed into every model
/// call; nothing selects a device implicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: usize,
}

impl Device {
    pub fn cpu(index: usize) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            index,
        }
    }

    pub fn cuda(index: usize) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index,
        }
    }

    /// `cuda:0` when built with CUDA support, otherwise `cpu:0`.
    pub fn preferred() -> Self {
        if cfg!(feature = "cuda") {
            Self::cuda(0)
        } else {
            Self::cpu(0)
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu:{}", self.index),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.index),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    /// Accepts `cpu`, `cpu:N`, `cuda:N` or a bare index (CUDA).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => (kind.to_string(), Some(index.to_string())),
            None if s == "cpu" || s == "cuda" => (s.clone(), None),
            None => ("cuda".to_string(), Some(s.clone())),
        };
        let index = match index {
            Some(i) => i
                .parse::<usize>()
                .map_err(|_| format!("invalid device index in '{}'", s))?,
            None => 0,
        };
        match kind.as_str() {
            "cpu" => Ok(Device::cpu(index)),
            "cuda" | "gpu" => Ok(Device::cuda(index)),
            other => Err(format!("unknown device kind '{}'", other)),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_matches_build() {
        let expected = if cfg!(feature = "cuda") {
            DeviceKind::Cuda
        } else {
            DeviceKind::Cpu
        };
        assert_eq!(Device::preferred(), Device { kind: expected, index: 0 });
    }

    #[test]
    fn test_parse_devices() {
        assert_eq!("cuda:2".parse::<Device>(), Ok(Device::cuda(2)));
        assert_eq!("3".parse::<Device>(), Ok(Device::cuda(3)));
        assert_eq!("cpu".parse::<Device>(), Ok(Device::cpu(0)));
        assert_eq!("CPU:1".parse::<Device>(), Ok(Device::cpu(1)));
        assert!("tpu:0".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let device = Device::cuda(7);
        assert_eq!(device.to_string(), "cuda:7");
        assert_eq!(device.to_string().parse::<Device>(), Ok(device));
    }
}
