//! Resume state
//!
//! When a non-infinite scan is interrupted, the engine persists the seed,
//! the lowest unfinished transmit index, and the shard spec. Reloading the
//! file continues the same permutation at the same position; the seed must
//! match or the index stream would enumerate different targets.

use crate::config::Shard;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub seed: u64,
    pub index: u64,
    pub shard: Shard,
}

impl ResumeState {
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let state: ResumeState = serde_json::from_str(&text)?;
        state.shard.validate()?;
        Ok(state)
    }

    /// Check the loaded state against the current configuration
    pub fn check_compatible(&self, seed: u64, shard: Shard) -> Result<()> {
        if self.seed != seed {
            return Err(Error::Config(format!(
                "resume seed {:#x} does not match configured seed {:#x}",
                self.seed, seed
            )));
        }
        if self.shard != shard {
            return Err(Error::Config(format!(
                "resume shard {}/{} does not match configured shard {}/{}",
                self.shard.one, self.shard.of, shard.one, shard.of
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let state = ResumeState {
            seed: 0xDEAD_BEEF,
            index: 123_456,
            shard: Shard { one: 2, of: 4 },
        };
        state.save(&path).unwrap();
        let loaded = ResumeState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_compatibility_check() {
        let state = ResumeState {
            seed: 7,
            index: 0,
            shard: Shard::default(),
        };
        assert!(state.check_compatible(7, Shard::default()).is_ok());
        assert!(state.check_compatible(8, Shard::default()).is_err());
        assert!(state
            .check_compatible(7, Shard { one: 1, of: 2 })
            .is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(ResumeState::load(Path::new("/nonexistent/resume.json")).is_err());
    }
}
