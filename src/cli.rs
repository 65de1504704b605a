//! Command-line surface.
//!
//! Every flag maps one-to-one onto a config key; values given on the
//! command line override the file. Exit codes: 0 success, 1 invalid
//! argument or initialization failure, 2 capture permission denied,
//! 130 SIGINT.

use clap::Parser;

use crate::config::{AudioSource, DisplayBackend, Options};
use crate::control::QualityPreset;
use crate::error::{Error, Result};
use crate::pipeline::types::{HardwareAccel, VideoCodec};

#[derive(Debug, Parser)]
#[command(name = "streamcast", version, about = "Low-latency desktop A/V streaming")]
pub struct Cli {
    /// Config file path (restricted to user config dirs, /etc/streamcast/,
    /// /tmp/streamcast/).
    #[arg(long)]
    pub config: Option<String>,

    /// Display backend: auto, x11, wayland.
    #[arg(long)]
    pub backend: Option<String>,

    /// Monitor id (-1 = primary).
    #[arg(long)]
    pub monitor: Option<i32>,

    /// Hide the cursor in the captured stream.
    #[arg(long)]
    pub no_cursor: bool,

    /// Video codec: h264, h265, vp9, av1.
    #[arg(long)]
    pub codec: Option<String>,

    /// Video bitrate in bits per second (100000..=100000000).
    #[arg(long)]
    pub bitrate: Option<u32>,

    /// Capture frame rate (1..=240).
    #[arg(long)]
    pub fps: Option<u32>,

    /// Quality preset: auto, low, medium, high, ultra.
    #[arg(long)]
    pub quality: Option<String>,

    /// Hardware encoder: none, vaapi, nvenc, amf, qsv.
    #[arg(long)]
    pub hw_accel: Option<String>,

    /// Disable audio capture.
    #[arg(long)]
    pub no_audio: bool,

    /// Audio source: system, microphone, mixed.
    #[arg(long)]
    pub audio_source: Option<String>,

    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port (1024..=65535, 0 = auto).
    #[arg(long)]
    pub port: Option<u16>,

    /// Verbose logging.
    #[arg(long, short)]
    pub verbose: bool,

    /// List monitors and exit.
    #[arg(long)]
    pub list_monitors: bool,

    /// Run the built-in loopback session for this many seconds (0 = until
    /// interrupted).
    #[arg(long, default_value_t = 0)]
    pub duration: u64,
}

impl Cli {
    /// Overlay this invocation onto file-loaded options.
    pub fn apply(&self, mut options: Options) -> Result<Options> {
        if let Some(backend) = &self.backend {
            options.display.backend = match backend.as_str() {
                "auto" => DisplayBackend::Auto,
                "x11" => DisplayBackend::X11,
                "wayland" => DisplayBackend::Wayland,
                other => {
                    return Err(Error::config(format!(
                        "backend must be auto/x11/wayland, got '{other}'"
                    )));
                }
            };
        }
        if let Some(monitor) = self.monitor {
            options.display.monitor = monitor;
        }
        if self.no_cursor {
            options.display.show_cursor = false;
        }
        if let Some(codec) = &self.codec {
            options.video.codec = match codec.as_str() {
                "h264" => VideoCodec::H264,
                "h265" => VideoCodec::H265,
                "vp9" => VideoCodec::Vp9,
                "av1" => VideoCodec::Av1,
                other => {
                    return Err(Error::config(format!(
                        "codec must be h264/h265/vp9/av1, got '{other}'"
                    )));
                }
            };
        }
        if let Some(bitrate) = self.bitrate {
            options.video.bitrate = bitrate;
        }
        if let Some(fps) = self.fps {
            options.video.fps = fps;
        }
        if let Some(quality) = &self.quality {
            options.video.quality = quality.parse::<QualityPreset>()?;
        }
        if let Some(hw) = &self.hw_accel {
            options.video.hw_accel = match hw.as_str() {
                "none" => HardwareAccel::None,
                "vaapi" => HardwareAccel::Vaapi,
                "nvenc" => HardwareAccel::Nvenc,
                "amf" => HardwareAccel::Amf,
                "qsv" => HardwareAccel::Qsv,
                other => {
                    return Err(Error::config(format!(
                        "hw-accel must be none/vaapi/nvenc/amf/qsv, got '{other}'"
                    )));
                }
            };
        }
        if self.no_audio {
            options.audio.enabled = false;
        }
        if let Some(source) = &self.audio_source {
            options.audio.source = match source.as_str() {
                "system" => AudioSource::System,
                "microphone" => AudioSource::Microphone,
                "mixed" => AudioSource::Mixed,
                other => {
                    return Err(Error::config(format!(
                        "audio-source must be system/microphone/mixed, got '{other}'"
                    )));
                }
            };
        }
        if let Some(bind) = &self.bind {
            options.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            options.network.port = port;
        }
        if self.verbose {
            options.logging.verbose = true;
        }

        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("streamcast").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = parse(&["--fps", "30", "--codec", "h265", "--verbose"]);
        let options = cli.apply(Options::default()).unwrap();
        assert_eq!(options.video.fps, 30);
        assert_eq!(options.video.codec, VideoCodec::H265);
        assert!(options.logging.verbose);
        // Untouched keys keep their file/default values.
        assert_eq!(options.display.monitor, -1);
    }

    #[test]
    fn test_invalid_enum_rejected() {
        let cli = parse(&["--codec", "mpeg2"]);
        let err = cli.apply(Options::default()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("mpeg2"));
    }

    #[test]
    fn test_out_of_range_rejected_after_merge() {
        let cli = parse(&["--fps", "300"]);
        assert!(cli.apply(Options::default()).is_err());
    }

    #[test]
    fn test_no_audio_flag() {
        let cli = parse(&["--no-audio"]);
        let options = cli.apply(Options::default()).unwrap();
        assert!(!options.audio.enabled);
    }
}
