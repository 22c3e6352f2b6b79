//! Probing and decoding: ffprobe JSON → [`VideoProperties`], ffmpeg stdout →
//! fixed-size raw RGB frames.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Stdio};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use super::{spawn_stderr_drain, StderrTarget};
use crate::error::PipelineError;
use crate::types::{frame_len, Frame, VideoProperties, RGB_CHANNELS};

const FALLBACK_FRAME_RATE: f64 = 23.976;

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

fn is_attached_picture(stream: &FfprobeStream) -> bool {
    stream
        .disposition
        .get("attached_pic")
        .and_then(|value| value.as_i64().map(|n| n != 0).or_else(|| value.as_bool()))
        .unwrap_or(false)
}

/// First video stream that is not cover art.
fn select_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| (is_attached_picture(stream), stream.index))
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe; is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

/// Map the primary video stream onto the properties of the decoded RGB stream.
pub fn video_properties_from_probe(probe: &FfprobeOutput) -> Result<VideoProperties> {
    let stream =
        select_video_stream(&probe.streams).ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let frame_rate = match parse_frame_rate(fps_str) {
        Some(fps) if fps > 0.0 => fps,
        _ => {
            warn!("could not determine frame rate (got {fps_str}), defaulting to {FALLBACK_FRAME_RATE}");
            FALLBACK_FRAME_RATE
        }
    };

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .or_else(|| {
            let duration = stream
                .duration
                .as_deref()
                .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))?
                .parse::<f64>()
                .ok()?;
            (duration > 0.0).then(|| (duration * frame_rate).round() as u64)
        });

    let mut props = VideoProperties::rgb24(width, height, frame_rate);
    props.frame_count = frame_count;
    if let Some(source_format) = &stream.pix_fmt {
        debug!(source_pix_fmt = %source_format, "Decoding to rgb24");
    }
    Ok(props)
}

pub fn probe_video(path: &Path) -> Result<VideoProperties> {
    if !path.exists() {
        bail!("input file does not exist: {}", path.display());
    }
    debug!(path = %path.display(), "running ffprobe");
    let probe = run_ffprobe(path)?;
    let props = video_properties_from_probe(&probe)
        .with_context(|| format!("failed to probe {}", path.display()))?;
    info!(
        width = props.width,
        height = props.height,
        fps = props.frame_rate,
        frames = ?props.frame_count,
        "Video probed"
    );
    Ok(props)
}

/// Splits a byte stream into fixed-size frames. A zero-length read at a frame
/// boundary ends the stream; a trailing partial frame is discarded.
pub struct RawFrameReader<R: Read> {
    reader: R,
    width: u32,
    height: u32,
    channels: u8,
    frame_size: usize,
    done: bool,
}

impl<R: Read> RawFrameReader<R> {
    pub fn new(reader: R, width: u32, height: u32, channels: u8) -> Self {
        Self {
            reader,
            width,
            height,
            channels,
            frame_size: frame_len(width, height, channels),
            done: false,
        }
    }

    pub fn for_properties(reader: R, props: &VideoProperties) -> Self {
        Self::new(reader, props.width, props.height, props.channels)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match self.reader.read(&mut buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipelineError::stream_io("decoder", e).into()),
            }
        }

        Ok(Some(Frame::new(buf, self.width, self.height, self.channels)?))
    }
}

impl<R: Read> Iterator for RawFrameReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn build_decoder_args(path: &Path) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-vsync".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// ffmpeg decode subprocess yielding rgb24 frames. Kills ffmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    frames: RawFrameReader<ChildStdout>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl VideoDecoder {
    pub fn new(path: &Path, props: &VideoProperties) -> Result<Self> {
        if props.channels != RGB_CHANNELS {
            return Err(PipelineError::configuration(format!(
                "decoder only produces rgb24, stream declares {} channels",
                props.channels
            ))
            .into());
        }

        let args = build_decoder_args(path);
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg decoder");

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg; is it installed?")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_thread = spawn_stderr_drain(stderr, StderrTarget::Decoder);

        Ok(Self {
            child,
            frames: RawFrameReader::for_properties(stdout, props),
            stderr_thread: Some(stderr_thread),
        })
    }

    pub fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            return Err(PipelineError::stream_io(
                "decoder",
                format!("ffmpeg exited with status {status}"),
            )
            .into());
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.frames.next()
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_type": "video",
                "width": 64,
                "height": 32,
                "pix_fmt": "mjpeg",
                "r_frame_rate": "90000/1",
                "disposition": { "attached_pic": 1 }
            },
            {
                "index": 1,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "24000/1001",
                "avg_frame_rate": "24000/1001",
                "nb_frames": "1440",
                "disposition": { "attached_pic": 0, "default": 1 }
            },
            {
                "index": 2,
                "codec_type": "audio"
            }
        ],
        "format": { "duration": "60.06" }
    }"#;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("24000/1001").expect("rational") - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_properties_skip_cover_art() {
        let probe = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).expect("parse");
        let props = video_properties_from_probe(&probe).expect("props");
        assert_eq!((props.width, props.height), (1920, 1080));
        assert_eq!(props.frame_count, Some(1440));
        assert_eq!(props.channels, 3);
        assert_eq!(props.pixel_format, "rgb24");
    }

    #[test]
    fn test_frame_count_falls_back_to_duration() {
        let json = r#"{
            "streams": [{
                "index": 0, "codec_type": "video", "width": 640, "height": 360,
                "r_frame_rate": "25/1"
            }],
            "format": { "duration": "4.0" }
        }"#;
        let probe = parse_ffprobe_json(json.as_bytes()).expect("parse");
        let props = video_properties_from_probe(&probe).expect("props");
        assert_eq!(props.frame_count, Some(100));
        assert_eq!(props.frame_rate, 25.0);
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{ "streams": [{ "index": 0, "codec_type": "audio" }] }"#;
        let probe = parse_ffprobe_json(json.as_bytes()).expect("parse");
        let error = video_properties_from_probe(&probe).expect_err("no video");
        assert!(error.to_string().contains("no video stream"));
    }

    #[test]
    fn test_raw_reader_splits_frames_and_drops_partial_tail() {
        let frame_size = 2 * 2 * 3;
        let mut bytes: Vec<u8> = (0..(frame_size * 3) as u8).collect();
        bytes.extend([1, 2, 3]);

        let frames: Vec<Frame> = RawFrameReader::new(Cursor::new(bytes), 2, 2, 3)
            .collect::<Result<_>>()
            .expect("frames");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].data()[0], frame_size as u8);
        assert!(frames.iter().all(|f| f.data().len() == frame_size));
    }

    #[test]
    fn test_raw_reader_empty_stream() {
        let mut reader = RawFrameReader::new(Cursor::new(Vec::new()), 4, 4, 3);
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn test_raw_reader_io_error_is_stream_error() {
        let mut reader = RawFrameReader::new(FailingReader, 4, 4, 3);
        let error = reader.next().expect("one item").expect_err("io error");
        assert!(matches!(
            crate::error::classify(&error),
            Some(PipelineError::StreamIo { stage: "decoder", .. })
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_decoder_args() {
        let args = build_decoder_args(Path::new("/tmp/in.mkv"));
        assert_eq!(args[0], "-nostdin");
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "rawvideo"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    #[ignore = "requires ffmpeg and REFRAME_TEST_VIDEO"]
    fn test_video_decoder_reads_frames() {
        let path = std::env::var("REFRAME_TEST_VIDEO").expect("REFRAME_TEST_VIDEO");
        let path = Path::new(&path);
        let props = probe_video(path).expect("probe");
        let mut decoder = VideoDecoder::new(path, &props).expect("decoder");
        let frame = decoder.next().expect("one frame").expect("decoded");
        assert_eq!(frame.data().len(), props.frame_len());
    }
}
