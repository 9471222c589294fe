use std::sync::{Arc, RwLock};

use crate::error::SmallError;

/// Type alias, not a new type: cannot define methods on it directly,
/// see [`crate::utils::HandyRwLock`] for the `.rl()`/`.wl()` shortcuts
/// used everywhere instead of spelling out `.read().unwrap()`.
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, SmallError>;
pub type SmallResult = Result<(), SmallError>;
