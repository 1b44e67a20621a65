use std::sync::{Arc, RwLock};

use crate::error::StratumError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, StratumError>;
pub type StratumResult = Result<(), StratumError>;
