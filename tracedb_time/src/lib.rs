//! Abstract time handling for the tracedb workspace.
//!
//! Production code obtains the current time through a [`TimeProvider`] handle
//! instead of calling the system clock directly, so that block-cut triggers,
//! retention and heartbeat logic are all testable with a [`MockProvider`].

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs
)]

use std::{
    fmt,
    future::Future,
    ops::{Add, Sub},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

/// A moment in time, with nanosecond precision.
///
/// Wraps a UTC datetime; serialises as an RFC 3339 string so it can be
/// embedded in JSON metadata objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// The instant `nanos` nanoseconds after the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// The instant `millis` milliseconds after the unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(Utc.timestamp_nanos(millis * 1_000_000))
    }

    /// Construct from an existing [`DateTime`].
    pub fn from_date_time(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Milliseconds since the unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The wrapped datetime.
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }

    /// `self + duration`, or `None` on overflow.
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        Some(Self(
            self.0
                .checked_add_signed(chrono::Duration::from_std(duration).ok()?)?,
        ))
    }

    /// `self - duration`, or `None` on underflow.
    pub fn checked_sub(&self, duration: Duration) -> Option<Self> {
        Some(Self(
            self.0
                .checked_sub_signed(chrono::Duration::from_std(duration).ok()?)?,
        ))
    }

    /// The absolute difference between two instants.
    pub fn absolute_difference(&self, other: Self) -> Duration {
        (self.0 - other.0)
            .abs()
            .to_std()
            .expect("absolute duration is non-negative")
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("time addition overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("time subtraction underflow")
    }
}

impl serde::Serialize for Time {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> serde::Deserialize<'de> for Time {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let dt = DateTime::parse_from_rfc3339(&s)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }
}

/// A future produced by [`TimeProvider::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of the current time.
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;

    /// Completes once `duration` has elapsed according to this provider.
    fn sleep(&self, duration: Duration) -> SleepFuture {
        self.sleep_until(self.now() + duration)
    }

    /// Completes once the provider's clock reaches `t`.
    fn sleep_until(&self, t: Time) -> SleepFuture;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Construct a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }

    fn sleep_until(&self, t: Time) -> SleepFuture {
        let now = self.now();
        let d = if t > now {
            t.absolute_difference(now)
        } else {
            Duration::ZERO
        };
        Box::pin(tokio::time::sleep(d))
    }
}

/// [`TimeProvider`] whose clock only moves when told to.
#[derive(Debug, Clone)]
pub struct MockProvider {
    now: Arc<Mutex<Time>>,
    notify: Arc<tokio::sync::Notify>,
}

impl MockProvider {
    /// A mock clock starting at `now`.
    pub fn new(now: Time) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            notify: Default::default(),
        }
    }

    /// Jump the clock to `now`.
    pub fn set(&self, now: Time) {
        *self.now.lock() = now;
        self.notify.notify_waiters();
    }

    /// Advance the clock by `duration`.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.lock();
        *now = *now + duration;
        let t = *now;
        drop(now);
        self.notify.notify_waiters();
        t
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.lock()
    }

    fn sleep_until(&self, t: Time) -> SleepFuture {
        let now = Arc::clone(&self.now);
        let notify = Arc::clone(&self.notify);
        Box::pin(async move {
            loop {
                // Register interest before checking the clock so a concurrent
                // `set`/`inc` cannot be missed.
                let notified = notify.notified();
                if *now.lock() >= t {
                    return;
                }
                notified.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arithmetic() {
        let t = Time::from_timestamp_millis(1_000);
        assert_eq!(t.timestamp_millis(), 1_000);
        assert_eq!((t + Duration::from_millis(500)).timestamp_millis(), 1_500);
        assert_eq!((t - Duration::from_millis(500)).timestamp_millis(), 500);
        assert_eq!(
            t.absolute_difference(Time::from_timestamp_millis(250)),
            Duration::from_millis(750)
        );
    }

    #[test]
    fn serde_round_trip() {
        let t = Time::from_timestamp_nanos(1_234_567_890_123_456_789);
        let json = serde_json::to_string(&t).unwrap();
        let back: Time = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }

    #[tokio::test]
    async fn mock_sleep_wakes_on_advance() {
        let mock = MockProvider::new(Time::from_timestamp_millis(0));
        let sleep = mock.sleep(Duration::from_millis(100));

        let waiter = tokio::spawn(sleep);
        mock.inc(Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("sleep should complete once clock advanced")
            .unwrap();
    }
}
