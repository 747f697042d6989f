//! Small trait seams, mockable in tests the way the teacher mocks its
//! network/clock collaborators with `mockall::automock`.

use anyhow::Result;
use std::time::Duration;

/// Host NTP/chrony cross-check (spec §6.2). Never feeds `D_clock`.
#[cfg_attr(test, mockall::automock)]
pub trait NtpSource {
    fn get_offset(&self) -> Result<(Duration, i8)>;
}
