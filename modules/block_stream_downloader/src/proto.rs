//! Generated block stream and block node API types

#![allow(clippy::all)]

tonic::include_proto!("block_stream");

impl Timestamp {
    /// Nanoseconds since the epoch
    pub fn to_nanos(&self) -> i64 {
        self.seconds.saturating_mul(1_000_000_000).saturating_add(self.nanos as i64)
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            seconds: nanos.div_euclid(1_000_000_000),
            nanos: nanos.rem_euclid(1_000_000_000) as i32,
        }
    }
}
