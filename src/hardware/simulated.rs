use std::collections::HashMap;
use std::time::Instant;

use crossbeam_channel::Sender;
use log::debug;

use super::interface::{AwgDevice, DeviceStatus};
use crate::types::{Channel, ChannelMask, TriggerMode, WaveShape};

/// One recorded driver call
#[derive(Debug, Clone, PartialEq)]
pub enum AwgCall {
    Open,
    Close,
    Configure {
        channel: Channel,
        amplitude: f64,
        shape: WaveShape,
    },
    Flush,
    Load {
        slot: u8,
        len: usize,
    },
    Queue {
        channel: Channel,
        slot: u8,
        trigger: TriggerMode,
        delay: u16,
        repeat: u32,
        prescale: u32,
    },
    SingleShot(Channel),
    Start(ChannelMask),
}

/// In-memory generator that records calls and can be told to fail
///
/// When a start signal is attached, a successful `start_channels` sends the started mask,
/// standing in for the trigger edge a real digitizer waits on.
#[derive(Debug, Default)]
pub struct SimulatedAwg {
    calls: Vec<AwgCall>,
    call_times: Vec<Instant>,
    loaded: HashMap<u8, Vec<f64>>,
    open: bool,
    started: Option<ChannelMask>,
    open_failure: Option<i32>,
    load_failures: HashMap<u8, i32>,
    queue_failures: HashMap<Channel, i32>,
    start_failure: Option<i32>,
    start_signal: Option<Sender<ChannelMask>>,
}

impl SimulatedAwg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(mut self, status: i32) -> Self {
        self.open_failure = Some(status);
        self
    }

    pub fn fail_load(mut self, slot: u8, status: i32) -> Self {
        self.load_failures.insert(slot, status);
        self
    }

    pub fn fail_queue(mut self, channel: Channel, status: i32) -> Self {
        self.queue_failures.insert(channel, status);
        self
    }

    pub fn fail_start(mut self, status: i32) -> Self {
        self.start_failure = Some(status);
        self
    }

    pub fn with_start_signal(mut self, signal: Sender<ChannelMask>) -> Self {
        self.start_signal = Some(signal);
        self
    }

    pub fn calls(&self) -> &[AwgCall] {
        &self.calls
    }

    /// When each entry of `calls` was made
    pub fn call_times(&self) -> &[Instant] {
        &self.call_times
    }

    pub fn loaded(&self, slot: u8) -> Option<&[f64]> {
        self.loaded.get(&slot).map(Vec::as_slice)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn started(&self) -> Option<ChannelMask> {
        self.started
    }

    fn record(&mut self, call: AwgCall) {
        self.calls.push(call);
        self.call_times.push(Instant::now());
    }

    fn fail(status: Option<i32>) -> Result<(), DeviceStatus> {
        match status {
            Some(code) => Err(DeviceStatus(code)),
            None => Ok(()),
        }
    }
}

impl AwgDevice for SimulatedAwg {
    fn open(&mut self) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Open);
        Self::fail(self.open_failure)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Close);
        self.open = false;
        Ok(())
    }

    fn configure_channel(
        &mut self,
        channel: Channel,
        amplitude: f64,
        shape: WaveShape,
    ) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Configure {
            channel,
            amplitude,
            shape,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Flush);
        self.loaded.clear();
        Ok(())
    }

    fn load_waveform(&mut self, samples: &[f64], slot: u8) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Load {
            slot,
            len: samples.len(),
        });
        Self::fail(self.load_failures.get(&slot).copied())?;
        self.loaded.insert(slot, samples.to_vec());
        Ok(())
    }

    fn queue_waveform(
        &mut self,
        channel: Channel,
        slot: u8,
        trigger: TriggerMode,
        delay: u16,
        repeat: u32,
        prescale: u32,
    ) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Queue {
            channel,
            slot,
            trigger,
            delay,
            repeat,
            prescale,
        });
        Self::fail(self.queue_failures.get(&channel).copied())
    }

    fn set_single_shot(&mut self, channel: Channel) -> Result<(), DeviceStatus> {
        self.record(AwgCall::SingleShot(channel));
        Ok(())
    }

    fn start_channels(&mut self, mask: ChannelMask) -> Result<(), DeviceStatus> {
        self.record(AwgCall::Start(mask));
        Self::fail(self.start_failure)?;
        self.started = Some(mask);
        if let Some(signal) = &self.start_signal {
            // Nobody listening is fine
            let _ = signal.send(mask);
            debug!("Simulated start edge sent for mask {:#06b}", mask.0);
        }
        Ok(())
    }
}
