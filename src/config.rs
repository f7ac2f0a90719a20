use crate::core::{KernelError, Result};
use crate::lock::LockLevel;
use serde::{Deserialize, Serialize};

/// What a transaction rollback puts back into managed instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    /// Nothing is restored; rolled-back instances are reloaded.
    None,
    /// Immutable fields are restored, mutable ones are unloaded.
    #[default]
    Immutable,
    /// Every loaded field is restored, mutable ones from a deep copy.
    All,
}

/// Which fields are cleared when a nontransactional instance joins an
/// optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoClear {
    /// Clear only on datastore (pessimistic) access.
    #[default]
    Datastore,
    /// Clear on every transactional access.
    All,
}

/// Handling of lifecycle listener failures.
///
/// With no flag set a failure is returned to the caller. Bulk operations
/// collect failures into one aggregate unless `fail_fast` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackMode {
    /// Abort a bulk operation at the first failure.
    pub fail_fast: bool,
    /// Log failures and carry on.
    pub log: bool,
    /// Drop listener failures entirely.
    pub ignore: bool,
}

impl CallbackMode {
    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            ..Self::default()
        }
    }

    pub fn log() -> Self {
        Self {
            log: true,
            ..Self::default()
        }
    }

    pub fn ignore() -> Self {
        Self {
            ignore: true,
            ..Self::default()
        }
    }
}

/// Persistence context configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Optimistic (version-checked) transactions
    pub optimistic: bool,

    /// Keep field values of committed instances instead of hollowing them
    pub retain_state: bool,

    pub restore_state: RestoreState,

    pub auto_clear: AutoClear,

    /// Guard the managed cache with a reentrant lock
    pub multithreaded: bool,

    /// Allow reads outside a transaction
    pub nontransactional_read: bool,

    /// Allow writes outside a transaction; they are applied at the next begin
    pub nontransactional_write: bool,

    /// Keep change tracking on detached mutable values
    pub detach_proxy_fields: bool,

    /// Attach new instances as copies instead of adopting the detached values
    pub copy_on_attach: bool,

    /// Lock level taken on transactional reads
    pub read_lock_level: LockLevel,

    /// Lock level taken on transactional writes
    pub write_lock_level: LockLevel,

    /// Passed through to the lock manager
    pub lock_timeout_ms: Option<u64>,

    pub callback_mode: CallbackMode,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            optimistic: true,
            retain_state: true,
            restore_state: RestoreState::Immutable,
            auto_clear: AutoClear::Datastore,
            multithreaded: false,
            nontransactional_read: true,
            nontransactional_write: false,
            detach_proxy_fields: false,
            copy_on_attach: true,
            read_lock_level: LockLevel::None,
            write_lock_level: LockLevel::None,
            lock_timeout_ms: None,
            callback_mode: CallbackMode::default(),
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: KernelConfig = serde_json::from_str(json)
            .map_err(|e| KernelError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_lock_level > self.write_lock_level {
            return Err(KernelError::Config(format!(
                "read lock level {} exceeds write lock level {}",
                self.read_lock_level, self.write_lock_level
            )));
        }
        if self.callback_mode.fail_fast && self.callback_mode.ignore {
            return Err(KernelError::Config(
                "callback mode cannot both fail fast and ignore failures".to_string(),
            ));
        }
        Ok(())
    }

    /// Set optimistic transactions
    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Set whether committed instances keep their field values
    pub fn retain_state(mut self, retain: bool) -> Self {
        self.retain_state = retain;
        self
    }

    pub fn restore_state(mut self, restore: RestoreState) -> Self {
        self.restore_state = restore;
        self
    }

    pub fn auto_clear(mut self, auto_clear: AutoClear) -> Self {
        self.auto_clear = auto_clear;
        self
    }

    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    pub fn nontransactional_read(mut self, allowed: bool) -> Self {
        self.nontransactional_read = allowed;
        self
    }

    pub fn nontransactional_write(mut self, allowed: bool) -> Self {
        self.nontransactional_write = allowed;
        self
    }

    pub fn detach_proxy_fields(mut self, keep: bool) -> Self {
        self.detach_proxy_fields = keep;
        self
    }

    pub fn copy_on_attach(mut self, copy: bool) -> Self {
        self.copy_on_attach = copy;
        self
    }

    pub fn read_lock_level(mut self, level: LockLevel) -> Self {
        self.read_lock_level = level;
        self
    }

    pub fn write_lock_level(mut self, level: LockLevel) -> Self {
        self.write_lock_level = level;
        self
    }

    /// Set the lock timeout in milliseconds
    pub fn lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.lock_timeout_ms = Some(timeout);
        self
    }

    pub fn callback_mode(mut self, mode: CallbackMode) -> Self {
        self.callback_mode = mode;
        self
    }

    pub fn is_auto_clear_all(&self) -> bool {
        self.auto_clear == AutoClear::All
    }
}
