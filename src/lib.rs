pub mod acquisition;
pub mod config;
pub mod digitizer;
pub mod error;
pub mod hardware;
pub mod live;
pub mod logger;
pub mod pattern;
pub mod plotting;
pub mod reassembly;
pub mod timing;
pub mod types;
pub mod waveform;

pub use acquisition::{
    plan_scan, Acquisition, ScanArea, ScanOutcome, ScanProgram, ScanRecord, ScanRequest,
};
pub use config::{ChannelAmplitudes, DigitizerSettings, ScanConfiguration};
pub use digitizer::{
    minimum_record_size, record_size, Digitizer, SampleRateLadder, SampleStream,
    SimulatedDigitizer,
};
pub use error::{ChannelFailure, ScanError};
pub use hardware::{
    dispatch, AwgDevice, AwgSession, DeviceStatus, DispatchReport, DispatchSettings, SimulatedAwg,
};
pub use live::{run_live, AnnularDetector, CameraClient, LiveSettings, SimulatedCamera, StreamStats};
pub use logger::{JournalFormat, RunJournal};
pub use pattern::{generate, generate_region, ScanAxisPlan};
pub use plotting::{plot_row_profile, plot_trace};
pub use reassembly::{reassemble, ReassemblyReport, ReconstructedImage};
pub use timing::{
    solve, solve_secondary, SecondaryTiming, TimingLimits, TimingParameters, TriggerDelayPolicy,
};
pub use types::{
    AcquisitionMode, Channel, ChannelMask, ScanGrid, ScanRegion, ScanScheme, TriggerMode,
    VoltageRange, WaveShape,
};
pub use waveform::{synthesize, WaveformBuffer, WaveformSet};
