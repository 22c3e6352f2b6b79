//! Encoding: raw RGB frames → ffmpeg stdin, muxed with the source's audio.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{spawn_stderr_drain, StderrTarget};
use crate::error::PipelineError;
use crate::pipeline::FrameSink;
use crate::types::{frame_len, Frame, RGB_CHANNELS};

/// Target size for the encoded stream, e.g. `1920x1080`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResolution {
    pub width: u32,
    pub height: u32,
}

impl std::str::FromStr for OutputResolution {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::configuration(format!("invalid resolution '{s}' (expected WxH)"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl std::fmt::Display for OutputResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Output rate for an interpolated stream. Slow motion keeps the source rate
/// so the extra frames stretch playback.
pub fn output_frame_rate(input_fps: f64, factor: f64, slowmo: bool) -> f64 {
    if slowmo {
        input_fps
    } else {
        input_fps * factor
    }
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// Source file whose audio is muxed into the output.
    pub source_path: Option<PathBuf>,
    /// Size of the frames written to the encoder.
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    pub preset: Option<String>,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub output_resolution: Option<OutputResolution>,
    pub overwrite: bool,
}

impl EncoderConfig {
    pub fn new(output_path: impl Into<PathBuf>, width: u32, height: u32, fps: f64) -> Self {
        Self {
            output_path: output_path.into(),
            source_path: None,
            width,
            height,
            fps,
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            preset: None,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            output_resolution: None,
            overwrite: true,
        }
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            if self.overwrite { "-y" } else { "-n" }.into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format_fps(self.fps),
            "-i".into(),
            "pipe:0".into(),
        ];

        if let Some(source) = &self.source_path {
            args.extend([
                "-i".into(),
                source.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a?".into(),
                "-c:a".into(),
                self.audio_codec.clone(),
            ]);
            if self.audio_codec != "copy" {
                args.extend(["-b:a".into(), self.audio_bitrate.clone()]);
            }
        }

        args.extend(["-c:v".into(), self.codec.clone()]);
        if self.codec.contains("nvenc") {
            args.extend(["-rc".into(), "vbr".into(), "-cq".into(), self.crf.to_string()]);
        } else {
            args.extend(["-crf".into(), self.crf.to_string()]);
        }
        if let Some(preset) = &self.preset {
            args.extend(["-preset".into(), preset.clone()]);
        }
        if let Some(resolution) = self.output_resolution {
            args.extend([
                "-vf".into(),
                format!("scale={}:{}", resolution.width, resolution.height),
            ]);
        }
        args.extend(["-pix_fmt".into(), self.pixel_format.clone()]);

        args.push(self.output_path.to_string_lossy().into_owned());
        args
    }

    pub fn frame_size(&self) -> usize {
        frame_len(self.width, self.height, RGB_CHANNELS)
    }
}

fn format_fps(fps: f64) -> String {
    let rounded = format!("{fps:.6}");
    rounded
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Writes frames as headerless bytes to any [`Write`].
pub struct RawFrameWriter<W: Write + Send + 'static> {
    writer: Option<W>,
    frame_size: usize,
}

impl<W: Write + Send + 'static> RawFrameWriter<W> {
    pub fn new(writer: W, frame_size: usize) -> Self {
        Self {
            writer: Some(writer),
            frame_size,
        }
    }

    /// Flushes and hands back the writer.
    pub fn into_inner(mut self) -> Result<W> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| anyhow!("writer already closed"))?;
        writer
            .flush()
            .map_err(|e| PipelineError::stream_io("encoder", e))?;
        Ok(writer)
    }
}

impl<W: Write + Send + 'static> FrameSink for RawFrameWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.data().len() != self.frame_size {
            return Err(PipelineError::ShapeMismatch {
                expected: self.frame_size,
                actual: frame.data().len(),
            }
            .into());
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::stream_io("encoder", "stdin already closed"))?;
        writer
            .write_all(frame.data())
            .map_err(|e| PipelineError::stream_io("encoder", e))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| PipelineError::stream_io("encoder", e))?;
        }
        Ok(())
    }
}

/// ffmpeg encode subprocess fed through stdin. Kills ffmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: RawFrameWriter<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    output_path: PathBuf,
    frames: u64,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_thread = spawn_stderr_drain(stderr, StderrTarget::Encoder);

        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            codec = %config.codec,
            crf = config.crf,
            pix_fmt = %config.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: RawFrameWriter::new(stdin, config.frame_size()),
            stderr_thread: Some(stderr_thread),
            output_path: config.output_path.clone(),
            frames: 0,
        })
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.stdin.write_frame(frame)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // Closing stdin is ffmpeg's end-of-stream.
        self.stdin.finish()?;

        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            return Err(PipelineError::stream_io(
                "encoder",
                format!("ffmpeg exited with status {status}"),
            )
            .into());
        }

        info!(
            frames = self.frames,
            output = %self.output_path.display(),
            "FFmpeg encoder finished"
        );
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        // Without a prior `finish` the run was aborted; kill before closing
        // stdin so ffmpeg does not finalize a partial file.
        let _ = self.child.kill();
        let _ = self.stdin.finish();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
