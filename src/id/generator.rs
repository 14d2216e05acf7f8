use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{IdError, Result};
use super::types::{IdInfo, IdStrategy};

const TIMESTAMP_WIDTH: usize = 13;
const COUNTER_MAX_TS: u32 = 0xFF_FFFF;
const COUNTER_MAX_HYBRID: u32 = 0xFFFF;

/// Counter state shared across calls on one generator instance.
struct CounterState {
    last_ms: i64,
    counter: u32,
}

/// Collision-resistant file identifier generator.
///
/// One instance is expected per process; call sites share it by reference.
pub struct FileIdGenerator {
    strategy: IdStrategy,
    node_id: u32,
    state: Mutex<CounterState>,
    custom: Option<Arc<dyn Fn() -> String + Send + Sync>>,
}

impl FileIdGenerator {
    pub fn new(strategy: IdStrategy, node_id: u32) -> Self {
        Self {
            strategy,
            node_id,
            state: Mutex::new(CounterState {
                last_ms: 0,
                counter: 0,
            }),
            custom: None,
        }
    }

    /// Attach the generator function for the `Custom` strategy.
    pub fn with_custom_generator(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Arc::new(generator));
        self
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Generate a single identifier.
    pub fn generate(&self) -> Result<String> {
        match self.strategy {
            IdStrategy::Uuid => Ok(uuid::Uuid::new_v4().to_string()),
            IdStrategy::TimestampCounter => {
                let (ts, counter) = self.next_slot(COUNTER_MAX_TS);
                Ok(format!("{:013x}-{:08x}-{:06x}", ts, self.node_id, counter))
            }
            IdStrategy::Hybrid => {
                let (ts, counter) = self.next_slot(COUNTER_MAX_HYBRID);
                let entropy: u32 = rand::random();
                Ok(format!(
                    "{:013x}-{:08x}-{:04x}-{:04x}",
                    ts,
                    entropy,
                    self.node_id & 0xFFFF,
                    counter
                ))
            }
            IdStrategy::Custom => match &self.custom {
                Some(generator) => Ok(generator()),
                None => Err(IdError::MissingCustomGenerator),
            },
        }
    }

    /// Generate `n` identifiers in one call.
    pub fn generate_batch(&self, n: usize) -> Result<Vec<String>> {
        if n == 0 {
            return Err(IdError::InvalidBatchSize(n));
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.generate()?);
        }
        Ok(ids)
    }

    /// Claim the next (timestamp, counter) slot.
    ///
    /// The counter advances only when two calls land in the same millisecond
    /// and resets on a new millisecond. If the counter space for one
    /// millisecond is exhausted, the call spins into the next millisecond
    /// instead of wrapping.
    fn next_slot(&self, counter_max: u32) -> (i64, u32) {
        let mut state = self.state.lock();
        let mut now = chrono::Utc::now().timestamp_millis();

        if now == state.last_ms {
            if state.counter >= counter_max {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = chrono::Utc::now().timestamp_millis();
                }
                state.last_ms = now;
                state.counter = 0;
            } else {
                state.counter += 1;
            }
        } else {
            state.last_ms = now;
            state.counter = 0;
        }

        (state.last_ms, state.counter)
    }

    /// Check that `id` is well-formed for this generator's strategy.
    pub fn validate(&self, id: &str) -> bool {
        match self.strategy {
            IdStrategy::Uuid => uuid::Uuid::parse_str(id).is_ok(),
            IdStrategy::TimestampCounter => Self::check_fields(id, &[TIMESTAMP_WIDTH, 8, 6]),
            IdStrategy::Hybrid => Self::check_fields(id, &[TIMESTAMP_WIDTH, 8, 4, 4]),
            IdStrategy::Custom => !id.is_empty(),
        }
    }

    /// Extract embedded fields from `id`. Returns `None` if the id does not
    /// match this generator's encoding.
    pub fn decode(&self, id: &str) -> Option<IdInfo> {
        if !self.validate(id) {
            return None;
        }

        match self.strategy {
            IdStrategy::Uuid => Some(IdInfo::strategy_only(IdStrategy::Uuid)),
            IdStrategy::Custom => Some(IdInfo::strategy_only(IdStrategy::Custom)),
            IdStrategy::TimestampCounter => {
                let parts: Vec<&str> = id.split('-').collect();
                Some(IdInfo {
                    strategy: IdStrategy::TimestampCounter,
                    timestamp_ms: i64::from_str_radix(parts[0], 16).ok(),
                    node_id: u32::from_str_radix(parts[1], 16).ok(),
                    counter: u32::from_str_radix(parts[2], 16).ok(),
                })
            }
            IdStrategy::Hybrid => {
                let parts: Vec<&str> = id.split('-').collect();
                Some(IdInfo {
                    strategy: IdStrategy::Hybrid,
                    timestamp_ms: i64::from_str_radix(parts[0], 16).ok(),
                    node_id: u32::from_str_radix(parts[2], 16).ok(),
                    counter: u32::from_str_radix(parts[3], 16).ok(),
                })
            }
        }
    }

    fn check_fields(id: &str, widths: &[usize]) -> bool {
        let parts: Vec<&str> = id.split('-').collect();
        if parts.len() != widths.len() {
            return false;
        }
        parts
            .iter()
            .zip(widths)
            .all(|(part, width)| part.len() == *width && part.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

impl Default for FileIdGenerator {
    fn default() -> Self {
        Self::new(IdStrategy::Hybrid, rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_generation() {
        let generator = FileIdGenerator::new(IdStrategy::Uuid, 1);
        let id = generator.generate().unwrap();

        assert!(generator.validate(&id));
        assert_eq!(
            generator.decode(&id),
            Some(IdInfo::strategy_only(IdStrategy::Uuid))
        );
    }

    #[test]
    fn test_timestamp_counter_format() {
        let generator = FileIdGenerator::new(IdStrategy::TimestampCounter, 0xDEAD);
        let id = generator.generate().unwrap();

        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 13);
        assert_eq!(parts[1], "0000dead");
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_hybrid_format() {
        let generator = FileIdGenerator::new(IdStrategy::Hybrid, 0x12345);
        let id = generator.generate().unwrap();

        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 13);
        assert_eq!(parts[1].len(), 8);
        // Node id is truncated to its low 16 bits.
        assert_eq!(parts[2], "2345");
        assert_eq!(parts[3].len(), 4);
    }

    #[test]
    fn test_uniqueness_under_burst() {
        // Far more ids than fit in one millisecond's counter space for the
        // default strategy.
        let generator = FileIdGenerator::new(IdStrategy::Hybrid, 7);
        let ids = generator.generate_batch(10_000).unwrap();

        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_timestamp_counter_monotonic() {
        let generator = FileIdGenerator::new(IdStrategy::TimestampCounter, 1);
        let ids = generator.generate_batch(5_000).unwrap();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_decode_round_trips_timestamp() {
        let generator = FileIdGenerator::new(IdStrategy::TimestampCounter, 42);
        let before = chrono::Utc::now().timestamp_millis();
        let id = generator.generate().unwrap();
        let after = chrono::Utc::now().timestamp_millis();

        let info = generator.decode(&id).unwrap();
        let ts = info.timestamp_ms.unwrap();
        assert!(ts >= before && ts <= after);
        assert_eq!(info.node_id, Some(42));
    }

    #[test]
    fn test_validate_rejects_foreign_encodings() {
        let generator = FileIdGenerator::new(IdStrategy::TimestampCounter, 1);

        assert!(!generator.validate("not-an-id"));
        assert!(!generator.validate(&uuid::Uuid::new_v4().to_string()));
        // Right shape, wrong character class.
        assert!(!generator.validate("zzzzzzzzzzzzz-00000001-000000"));

        let hybrid = FileIdGenerator::new(IdStrategy::Hybrid, 1);
        let id = generator.generate().unwrap();
        assert!(!hybrid.validate(&id));
    }

    #[test]
    fn test_custom_without_generator_fails_at_generation() {
        let generator = FileIdGenerator::new(IdStrategy::Custom, 1);
        assert!(matches!(
            generator.generate(),
            Err(IdError::MissingCustomGenerator)
        ));
    }

    #[test]
    fn test_custom_with_generator() {
        let generator = FileIdGenerator::new(IdStrategy::Custom, 1)
            .with_custom_generator(|| "fixed-id".to_string());

        assert_eq!(generator.generate().unwrap(), "fixed-id");
        assert!(generator.validate("fixed-id"));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let generator = FileIdGenerator::default();
        assert!(matches!(
            generator.generate_batch(0),
            Err(IdError::InvalidBatchSize(0))
        ));
    }
}
