use serde::{Deserialize, Serialize};

/// Tile construction parameters.
///
/// Zero values select defaults derived from the bindings at boot; nothing is
/// validated until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Credit budget. `0` means the smallest input or output ring depth.
    pub cr_max: u64,
    /// Target duration of one housekeeping cycle in ns. `<= 0` derives it
    /// from `cr_max`.
    pub lazy: i64,
    /// Seed for the fairness shuffles and deadline jitter.
    pub seed: u64,
    /// Clock ticks per ns.
    pub tick_per_ns: f64,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            cr_max: 0,
            lazy: 0,
            seed: 0,
            tick_per_ns: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: TileConfig = serde_json::from_str(r#"{ "cr_max": 64, "seed": 9 }"#).unwrap();
        assert_eq!(
            cfg,
            TileConfig {
                cr_max: 64,
                seed: 9,
                ..TileConfig::default()
            }
        );
        assert_eq!(cfg.tick_per_ns, 1.0);
    }

    #[test]
    fn serializes_every_field() {
        let json = serde_json::to_value(TileConfig::default()).unwrap();
        assert_eq!(json["lazy"], 0);
        assert_eq!(json["tick_per_ns"], 1.0);
    }
}
