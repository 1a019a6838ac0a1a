use std::fmt;
use std::ops::{Deref, DerefMut};

use log::{debug, warn};

use crate::error::ScanError;
use crate::types::{Channel, ChannelMask, TriggerMode, WaveShape};

/// Negative status code returned by the vendor driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub i32);

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

impl DeviceStatus {
    pub fn into_hardware_error(self, context: impl Into<String>) -> ScanError {
        ScanError::Hardware {
            status: self.0,
            context: context.into(),
        }
    }
}

/// Capabilities of a four-channel arbitrary waveform generator
///
/// Mirrors the vendor driver's calls one to one; every call may fail with a status code.
/// Implementations must be `Send` so dispatch can run beside a blocking digitizer fetch.
pub trait AwgDevice: Send {
    // === Session ===

    fn open(&mut self) -> Result<(), DeviceStatus>;

    fn close(&mut self) -> Result<(), DeviceStatus>;

    // === Channel setup ===

    /// Set output amplitude (V) and function for one channel
    fn configure_channel(
        &mut self,
        channel: Channel,
        amplitude: f64,
        shape: WaveShape,
    ) -> Result<(), DeviceStatus>;

    /// Clear every channel queue
    fn flush(&mut self) -> Result<(), DeviceStatus>;

    // === Waveform memory ===

    /// Copy normalized samples into on-board memory
    ///
    /// # Arguments
    /// * `samples` - Values in [-1, 1], scaled by the channel amplitude on output
    /// * `slot` - Waveform memory slot referenced by later queue calls
    fn load_waveform(&mut self, samples: &[f64], slot: u8) -> Result<(), DeviceStatus>;

    /// Append a loaded waveform to a channel queue
    ///
    /// # Arguments
    /// * `channel` - Output channel
    /// * `slot` - Previously loaded waveform slot
    /// * `trigger` - Start condition
    /// * `delay` - Start delay in 10 ns ticks
    /// * `repeat` - Back-to-back playback count
    /// * `prescale` - Base clock divider
    fn queue_waveform(
        &mut self,
        channel: Channel,
        slot: u8,
        trigger: TriggerMode,
        delay: u16,
        repeat: u32,
        prescale: u32,
    ) -> Result<(), DeviceStatus>;

    // === Playback ===

    fn set_single_shot(&mut self, channel: Channel) -> Result<(), DeviceStatus>;

    /// Start all masked channels on the same clock edge
    fn start_channels(&mut self, mask: ChannelMask) -> Result<(), DeviceStatus>;
}

/// Open device handle that is closed on every exit path
pub struct AwgSession<'a, D: AwgDevice + ?Sized> {
    device: &'a mut D,
    open: bool,
}

impl<'a, D: AwgDevice + ?Sized> AwgSession<'a, D> {
    pub fn open(device: &'a mut D) -> Result<Self, ScanError> {
        device
            .open()
            .map_err(|status| ScanError::DeviceUnavailable(format!("open failed ({status})")))?;
        debug!("Waveform generator opened");
        Ok(Self { device, open: true })
    }

    /// Close now and report the result instead of only logging it
    pub fn close(mut self) -> Result<(), ScanError> {
        self.open = false;
        self.device
            .close()
            .map_err(|status| status.into_hardware_error("close"))
    }
}

impl<D: AwgDevice + ?Sized> Deref for AwgSession<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: AwgDevice + ?Sized> DerefMut for AwgSession<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: AwgDevice + ?Sized> Drop for AwgSession<'_, D> {
    fn drop(&mut self) {
        if self.open {
            if let Err(status) = self.device.close() {
                warn!("Failed to close waveform generator: {status}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{AwgCall, SimulatedAwg};

    #[test]
    fn test_session_closes_on_drop() {
        let mut awg = SimulatedAwg::new();
        {
            let mut session = AwgSession::open(&mut awg).unwrap();
            session.flush().unwrap();
        }
        assert_eq!(awg.calls().last(), Some(&AwgCall::Close));
        assert!(!awg.is_open());
    }

    #[test]
    fn test_session_explicit_close_does_not_close_twice() {
        let mut awg = SimulatedAwg::new();
        let session = AwgSession::open(&mut awg).unwrap();
        session.close().unwrap();
        let closes = awg
            .calls()
            .iter()
            .filter(|c| **c == AwgCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_open_failure_is_device_unavailable() {
        let mut awg = SimulatedAwg::new().fail_open(-8000);
        assert!(matches!(
            AwgSession::open(&mut awg),
            Err(ScanError::DeviceUnavailable(_))
        ));
        assert!(!awg.calls().contains(&AwgCall::Close));
    }
}
