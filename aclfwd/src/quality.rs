//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

//! Per-link loss/delay/jitter tracking, an optional component, and the
//! service-class tolerance table that quality-aware policies filter against.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// A snapshot of a link's quality counters.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Quality {
    /// Percentage packet loss, `0..=100`.
    pub loss: u32,
    pub delay_us: u32,
    pub jitter_us: u32,
}

impl Quality {
    /// A link with 100% loss is treated as administratively down for
    /// policy purposes.
    pub fn is_down(&self) -> bool {
        self.loss >= 100
    }

    /// Whether this quality satisfies a service class's tolerance.
    pub fn within(&self, tolerance: &QualityTolerance) -> bool {
        self.loss <= tolerance.max_loss
            && self.delay_us <= tolerance.max_delay_us
            && self.jitter_us <= tolerance.max_jitter_us
    }
}

/// Lock-free holder for a single link's quality counters, updated by
/// `quality_set` and read by the datapath decision step without locking;
/// the datapath must never block on control-plane state.
#[derive(Debug, Default)]
pub struct AtomicQuality {
    loss: AtomicU32,
    delay_us: AtomicU32,
    jitter_us: AtomicU32,
}

impl AtomicQuality {
    pub fn load(&self) -> Quality {
        Quality {
            loss: self.loss.load(Ordering::Relaxed),
            delay_us: self.delay_us.load(Ordering::Relaxed),
            jitter_us: self.jitter_us.load(Ordering::Relaxed),
        }
    }

    pub fn set_loss(&self, loss: u32) {
        self.loss.store(loss, Ordering::Relaxed);
    }

    pub fn set_delay_us(&self, delay_us: u32) {
        self.delay_us.store(delay_us, Ordering::Relaxed);
    }

    pub fn set_jitter_us(&self, jitter_us: u32) {
        self.jitter_us.store(jitter_us, Ordering::Relaxed);
    }
}

/// RFC-4594-style service classes, indexing `SERVICE_CLASS_TOLERANCE`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ServiceClass {
    Default,
    RealTime,
    Bronze,
    Silver,
    Gold,
}

impl ServiceClass {
    fn index(self) -> usize {
        match self {
            ServiceClass::Default => 0,
            ServiceClass::RealTime => 1,
            ServiceClass::Bronze => 2,
            ServiceClass::Silver => 3,
            ServiceClass::Gold => 4,
        }
    }

    pub fn tolerance(self) -> QualityTolerance {
        SERVICE_CLASS_TOLERANCE[self.index()]
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QualityTolerance {
    pub max_loss: u32,
    pub max_delay_us: u32,
    pub max_jitter_us: u32,
}

/// Static tolerance table, one entry per [`ServiceClass`]. `Default` imposes
/// no filtering (max values saturate at the counters' own ceiling); the rest
/// tighten progressively toward `RealTime`.
pub static SERVICE_CLASS_TOLERANCE: [QualityTolerance; 5] = [
    QualityTolerance {
        max_loss: 100,
        max_delay_us: u32::MAX,
        max_jitter_us: u32::MAX,
    },
    QualityTolerance {
        max_loss: 1,
        max_delay_us: 150_000,
        max_jitter_us: 30_000,
    },
    QualityTolerance {
        max_loss: 5,
        max_delay_us: 400_000,
        max_jitter_us: 100_000,
    },
    QualityTolerance {
        max_loss: 2,
        max_delay_us: 250_000,
        max_jitter_us: 60_000,
    },
    QualityTolerance {
        max_loss: 1,
        max_delay_us: 100_000,
        max_jitter_us: 20_000,
    },
];
