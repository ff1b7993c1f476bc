#![allow(dead_code)]

use bond_net::{Packet, PacketReader, PacketRegistry, PacketWriter, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Text payload with the `{data}` shape used across the tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Sample {
    pub data: String,
}

impl Sample {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }
}

impl Packet for Sample {
    fn key(&self) -> u32 {
        0
    }

    fn write(&self, w: &mut PacketWriter) -> Result<()> {
        w.write_string(&self.data)?;
        Ok(())
    }

    fn read(&mut self, r: &mut PacketReader) -> Result<()> {
        self.data = r.read_string()?;
        Ok(())
    }
}

/// Numbered packet for ordering checks.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Seq {
    pub n: u32,
}

impl Packet for Seq {
    fn key(&self) -> u32 {
        1
    }

    fn write(&self, w: &mut PacketWriter) -> Result<()> {
        w.write_u32(self.n);
        Ok(())
    }

    fn read(&mut self, r: &mut PacketReader) -> Result<()> {
        self.n = r.read_u32()?;
        Ok(())
    }
}

pub fn registry() -> Arc<PacketRegistry> {
    let registry = PacketRegistry::new();
    registry.register::<Sample>().unwrap().register::<Seq>().unwrap();
    Arc::new(registry)
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub const WAIT: Duration = Duration::from_secs(5);
