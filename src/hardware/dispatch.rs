use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::interface::{AwgDevice, AwgSession};
use crate::config::{ChannelAmplitudes, ScanConfiguration};
use crate::error::ScanError;
use crate::types::{Channel, ChannelMask, TriggerMode, WaveShape};
use crate::waveform::{WaveformBuffer, WaveformSet};

/// Channel-level settings applied while dispatching a program
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub amplitudes: ChannelAmplitudes,
    pub shape: WaveShape,
    pub trigger_mode: TriggerMode,
    /// Wait between queuing the last channel and the synchronous start
    pub settle_delay: Duration,
    pub start_mask: ChannelMask,
}

impl DispatchSettings {
    pub fn from_config(config: &ScanConfiguration) -> Self {
        Self {
            amplitudes: config.amplitudes.clone(),
            shape: WaveShape::Arbitrary,
            trigger_mode: TriggerMode::Auto,
            settle_delay: config.settle_delay(),
            start_mask: config.mode.start_mask(),
        }
    }
}

/// Outcome of a dispatch that reached channel start
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub queued: Vec<Channel>,
    pub start_mask: ChannelMask,
    pub prescale: u32,
}

fn load_and_queue<D: AwgDevice + ?Sized>(
    device: &mut D,
    buffer: &WaveformBuffer,
    prescale: u32,
    trigger: TriggerMode,
) -> Result<(), ScanError> {
    let channel = buffer.channel;
    let slot = channel.slot();

    device
        .load_waveform(&buffer.samples, slot)
        .map_err(|status| ScanError::Load {
            channel,
            slot,
            status: status.0,
        })?;

    device
        .queue_waveform(
            channel,
            slot,
            trigger,
            buffer.trigger_delay,
            buffer.repeat_count,
            prescale,
        )
        .map_err(|status| ScanError::Queue {
            channel,
            status: status.0,
        })
}

/// Program all four channels and start them together
///
/// Load and queue failures are logged per channel and dispatch carries on with the rest,
/// but no channel is started unless all four were queued.
///
/// # Arguments
/// * `device` - Generator to program; opened and closed within this call
/// * `waveforms` - The four channel buffers
/// * `prescale` - Base clock divider shared by every channel
/// * `settings` - Amplitudes, start mask and settle delay
pub fn dispatch<D: AwgDevice + ?Sized>(
    device: &mut D,
    waveforms: &WaveformSet,
    prescale: u32,
    settings: &DispatchSettings,
) -> Result<DispatchReport, ScanError> {
    let mut session = AwgSession::open(device)?;

    for channel in Channel::ALL {
        let amplitude = settings.amplitudes.for_channel(channel);
        // Channels left out of the start mask stay idle
        let shape = if settings.start_mask.contains(channel) {
            settings.shape
        } else {
            WaveShape::Off
        };
        session
            .configure_channel(channel, amplitude, shape)
            .map_err(|status| status.into_hardware_error(format!("configure {channel}")))?;
    }
    session
        .flush()
        .map_err(|status| status.into_hardware_error("flush"))?;

    let mut failures = Vec::new();
    let mut queued = Vec::new();
    for buffer in waveforms.iter() {
        match load_and_queue(&mut *session, buffer, prescale, settings.trigger_mode) {
            Ok(()) => {
                debug!(
                    "Queued {} samples x{} on {}",
                    buffer.len(),
                    buffer.repeat_count,
                    buffer.channel
                );
                queued.push(buffer.channel);
            }
            Err(err) => {
                error!("{err}");
                if let Some(failure) = err.as_channel_failure() {
                    failures.push(failure);
                }
            }
        }
    }

    // Every queue stops on its own after its repeat count
    for channel in Channel::ALL {
        session
            .set_single_shot(channel)
            .map_err(|status| status.into_hardware_error(format!("single shot on {channel}")))?;
    }

    if !failures.is_empty() {
        warn!(
            "Not starting any channel: {} channel operation(s) failed",
            failures.len()
        );
        return Err(ScanError::StartWithheld(failures));
    }

    debug!("Settling for {:?} before start", settings.settle_delay);
    thread::sleep(settings.settle_delay);

    session
        .start_channels(settings.start_mask)
        .map_err(|status| status.into_hardware_error("start"))?;
    info!("Started channels with mask {:#06b}", settings.start_mask.0);

    session.close()?;

    Ok(DispatchReport {
        queued,
        start_mask: settings.start_mask,
        prescale,
    })
}
