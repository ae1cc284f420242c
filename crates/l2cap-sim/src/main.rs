//! l2cap-sim - runs two L2CAP engines against each other over a loopback
//! controller
//!
//! Opens a classic channel and an LE credit based channel from a central
//! to a peripheral, moves some data across, closes both and lets the idle
//! links time out.
//!
//! Usage: l2cap-sim [config.toml]

mod controller;
mod side;

use std::env;
use std::error::Error;
use std::sync::Arc;

use log::{info, warn};

use l2cap_engine::l2cap::{DataWriteStatus, LeCreditBasedConfig};
use l2cap_engine::{BdAddr, StackConfig};

use controller::Controller;
use side::{Clock, Side};

const CLASSIC_PSM: u16 = 0x1001;
const LE_PSM: u16 = 0x0080;

/// Rounds of message passing before the traffic counts as stuck
const MAX_SETTLE_ROUNDS: usize = 10_000;
/// Simulated milliseconds after which pending timers are abandoned
const MAX_SIM_TIME_MS: u64 = 120_000;

struct Sim {
    clock: Clock,
    controller: Controller,
    central: Side,
    peripheral: Side,
}

impl Sim {
    fn new(config: &StackConfig) -> Self {
        let clock = Clock::default();
        Self {
            central: Side::new(
                "central",
                BdAddr::new([0x01, 0x00, 0x00, 0xC0, 0xFF, 0xEE]),
                config,
                Arc::clone(&clock),
            ),
            peripheral: Side::new(
                "peripheral",
                BdAddr::new([0x02, 0x00, 0x00, 0xC0, 0xFF, 0xEE]),
                config,
                Arc::clone(&clock),
            ),
            controller: Controller::new(config),
            clock,
        }
    }

    /// Passes messages until neither host has anything left to say
    fn settle(&mut self) -> bool {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut progressed = self.controller.pump(&mut self.central, &mut self.peripheral);
            progressed |= self.controller.pump(&mut self.peripheral, &mut self.central);
            progressed |= self.central.react();
            progressed |= self.peripheral.react();
            if !progressed {
                return true;
            }
        }
        warn!("traffic still flowing after {} rounds", MAX_SETTLE_ROUNDS);
        false
    }

    /// Settles, then fires timers in deadline order until `done` holds.
    /// False when time runs out first.
    fn run_until(&mut self, done: impl Fn(&Sim) -> bool) -> bool {
        loop {
            if !self.settle() {
                return false;
            }
            if done(self) {
                return true;
            }

            let next = match (self.central.next_deadline(), self.peripheral.next_deadline()) {
                (Some((id, at)), Some((_, other))) if at <= other => (true, id, at),
                (Some((id, at)), None) => (true, id, at),
                (_, Some((id, at))) => (false, id, at),
                (None, None) => return false,
            };
            let (on_central, id, at) = next;
            if at > MAX_SIM_TIME_MS {
                warn!("giving up at {} ms", at);
                return false;
            }

            {
                let mut now = self.clock.lock();
                *now = (*now).max(at);
            }
            if on_central {
                self.central.fire(id);
            } else {
                self.peripheral.fire(id);
            }
        }
    }

    fn write(&mut self, lcid: u16, data: Vec<u8>) {
        let len = data.len();
        match self.central.l2cap.data_write(lcid, data) {
            DataWriteStatus::Success => info!("central: queued {} bytes on 0x{:04X}", len, lcid),
            DataWriteStatus::Congested => info!("central: 0x{:04X} congested after {} bytes", lcid, len),
            DataWriteStatus::Failed => warn!("central: write of {} bytes on 0x{:04X} failed", len, lcid),
        }
    }

    fn no_links(&self) -> bool {
        self.central.l2cap.links().next().is_none() && self.peripheral.l2cap.links().next().is_none()
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            StackConfig::load(&path)?
        }
        None => StackConfig::default(),
    };

    let mut sim = Sim::new(&config);
    sim.central.register(CLASSIC_PSM, LE_PSM)?;
    sim.peripheral.register(CLASSIC_PSM, LE_PSM)?;
    let peer = sim.peripheral.addr;

    info!("Opening classic channel to {} on PSM 0x{:04X}", peer, CLASSIC_PSM);
    let lcid = sim.central.l2cap.connect_req(CLASSIC_PSM, peer, None)?;
    if !sim.run_until(|sim| sim.central.is_open(lcid)) {
        return Err("classic channel did not open".into());
    }

    for i in 1..=3 {
        sim.write(lcid, format!("classic message {}", i).into_bytes());
    }
    // Larger than one ACL buffer, goes out in fragments
    sim.write(lcid, vec![b'#'; 1500]);
    sim.settle();

    info!("Closing classic channel 0x{:04X}", lcid);
    sim.central.l2cap.disconnect_req(lcid)?;
    sim.settle();

    info!("Opening LE channel to {} on LE PSM 0x{:04X}", peer, LE_PSM);
    let le_config = LeCreditBasedConfig {
        mtu: 512,
        mps: 64,
        credits: 10,
    };
    let le_lcid = sim.central.l2cap.connect_le_req(LE_PSM, peer, le_config)?;
    if !sim.run_until(|sim| sim.central.is_open(le_lcid)) {
        return Err("LE channel did not open".into());
    }

    sim.write(le_lcid, b"LE credit based SDU ".repeat(5));
    sim.settle();

    info!("Closing LE channel 0x{:04X}", le_lcid);
    sim.central.l2cap.disconnect_req(le_lcid)?;

    if !sim.run_until(Sim::no_links) {
        warn!("links still up when the simulation ended");
    }

    println!("\nSimulation finished at {} ms", *sim.clock.lock());
    for side in [&sim.central, &sim.peripheral] {
        println!(
            "  {:<10} opened {} closed {} channels, received {} SDUs ({} bytes), {} ACL links left",
            side.name,
            side.stats.channels_opened,
            side.stats.channels_closed,
            side.stats.sdus_received,
            side.stats.bytes_received,
            side.acl.lock().num_acl_links()
        );
    }

    Ok(())
}
