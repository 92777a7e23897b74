//! Supported device brands and the transport family each one speaks

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// How a brand's devices are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Encrypted BLE advertisements, received passively
    RadioBroadcast,
    /// Request/response over the local IP network
    NetworkPoll,
}

/// Supported device vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brand {
    Victron,
    Renogy,
}

impl Brand {
    pub const ALL: [Brand; 2] = [Brand::Victron, Brand::Renogy];

    /// Transport family used by this brand
    pub fn transport(self) -> TransportKind {
        match self {
            Brand::Victron => TransportKind::RadioBroadcast,
            Brand::Renogy => TransportKind::NetworkPoll,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Brand::Victron => "victron",
            Brand::Renogy => "renogy",
        }
    }
}

impl std::fmt::Display for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown brand '{0}'")]
pub struct ParseBrandError(pub String);

impl FromStr for Brand {
    type Err = ParseBrandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Brand::ALL
            .into_iter()
            .find(|brand| brand.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseBrandError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_transport_mapping() {
        assert_eq!(Brand::Victron.transport(), TransportKind::RadioBroadcast);
        assert_eq!(Brand::Renogy.transport(), TransportKind::NetworkPoll);
    }

    #[test]
    fn test_brand_parse() {
        assert_eq!("victron".parse::<Brand>(), Ok(Brand::Victron));
        assert_eq!("Renogy".parse::<Brand>(), Ok(Brand::Renogy));
        assert_eq!(
            "epever".parse::<Brand>(),
            Err(ParseBrandError("epever".to_string()))
        );
    }

    #[test]
    fn test_brand_display_roundtrip() {
        for brand in Brand::ALL {
            assert_eq!(brand.to_string().parse::<Brand>(), Ok(brand));
        }
    }
}
