pub use std::{
    cell::Cell,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};
pub use thiserror::Error;
pub use itertools::Itertools;
pub use indexmap::IndexMap;
pub use clap::{Parser, Subcommand};

pub use crate::{Device,
    config::{DeviceConfig, parse_mask},
    sync::{IrqGuard, IrqSpinLock, SleepLock, in_atomic, might_sleep},
    js::{Atom, Context, CoreReq, CtxCreateFlags, CtxSchedInfo, JsDevice, RunpoolIrq,
        ctx_attr::{Attribute, AttrSet, AtomAttrs, AtomRetainedAttrs, CtxAttrState,
            RunpoolAttrState, ATTR_COUNT},
    },
    pm::{CoreMasks, PmActiveRef, PmDevice, PowerChange,
        policy::{CaPolicy, PolicyData, PolicyId},
    },
};

/// A bitmask over shader cores; bit `n` stands for core `n`.
pub type CoreMask = u64;

/// Attribute reference counts. Never negative: a release that would
/// underflow is a caller bug and is asserted against.
pub type RefCount = u32;

#[derive(Error, Debug)]
/// Everything that can go wrong at run time without being a bug
/// in the caller.
pub enum PmError {
    #[error("core availability policy `{policy}` failed to initialize: {reason}")]
    PolicyInit {
        policy: &'static str,
        reason: String,
    },
    #[error("no core availability policy named `{0}`")]
    UnknownPolicy(String),
    #[error("core mask {mask:#x} selects none of the present cores ({present:#x})")]
    InvalidCoreMask {
        mask:       CoreMask,
        present:    CoreMask,
    },
    #[error("bad device configuration: {0}")]
    Config(String),
}
