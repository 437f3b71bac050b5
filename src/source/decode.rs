// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia::default::get_codecs;
use symphonia::default::get_probe;

use super::error::SourceError;
use super::TrackData;

/// A chunked decoder over one audio file. Backs both preloading (drained in
/// one go) and streaming playback (read incrementally by a loader thread).
pub struct FileStream {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    channels: u16,
    sample_rate: u32,
    duration_frames: u64,
    finished: bool,
    /// Samples decoded beyond what the last chunk could take.
    leftover: Vec<f32>,
    /// Frames to discard after a coarse container seek so playback resumes
    /// at the exact requested frame.
    skip_frames: u64,
}

impl FileStream {
    /// Opens a file and probes its format. Fails if no decodable audio track
    /// is present or the metadata is unusable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileStream, SourceError> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            SourceError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path_ref.display(), e),
            ))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path_ref.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();
        let probed = get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| SourceError::Unsupported(format!("{}: {}", path_ref.display(), e)))?;

        let mut format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                SourceError::Unsupported(format!("{}: no audio track found", path_ref.display()))
            })?;

        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or_else(|| {
            SourceError::Unsupported(format!(
                "{}: sample rate not specified",
                path_ref.display()
            ))
        })?;
        let n_frames = params.n_frames;

        let decoder_opts: DecoderOptions = Default::default();
        let mut decoder = get_codecs()
            .make(params, &decoder_opts)
            .map_err(|e| SourceError::Unsupported(format!("{}: {}", path_ref.display(), e)))?;

        // Prefer container metadata for the channel count; when it's missing,
        // decode the first audio packet and derive it from the decoded buffer.
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
        let (channels, initial_leftover) = if channels > 0 {
            (channels, Vec::new())
        } else {
            match Self::read_and_decode_next(format_reader.as_mut(), decoder.as_mut(), track_id)? {
                Some((samples, ch)) => (ch as u16, samples),
                None => {
                    return Err(SourceError::Unsupported(format!(
                        "{}: channels not specified",
                        path_ref.display()
                    )))
                }
            }
        };

        let duration_frames = n_frames.unwrap_or(0);

        Ok(FileStream {
            format_reader,
            decoder,
            track_id,
            channels,
            sample_rate,
            duration_frames,
            finished: false,
            leftover: initial_leftover,
            skip_frames: 0,
        })
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total source length in frames. Zero when the container does not report
    /// it (e.g. some live streams); streaming tracks then report an unknown
    /// duration.
    pub fn duration_frames(&self) -> u64 {
        self.duration_frames
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Reads up to `max_frames` interleaved frames into `out` (cleared
    /// first). Returns the number of frames read; zero means end of source.
    pub fn next_chunk(&mut self, out: &mut Vec<f32>, max_frames: usize) -> Result<usize, SourceError> {
        out.clear();
        if self.finished || max_frames == 0 {
            return Ok(0);
        }

        let channels = self.channels as usize;
        let target = max_frames * channels;

        loop {
            // Drain leftovers (from the previous chunk or a seek skip) first.
            if !self.leftover.is_empty() {
                let skip = (self.skip_frames as usize * channels).min(self.leftover.len());
                if skip > 0 {
                    self.leftover.drain(..skip);
                    self.skip_frames -= (skip / channels) as u64;
                    continue;
                }
                let take = (target - out.len()).min(self.leftover.len());
                out.extend(self.leftover.drain(..take));
                if out.len() >= target {
                    return Ok(max_frames);
                }
            }

            match Self::read_and_decode_next(
                self.format_reader.as_mut(),
                self.decoder.as_mut(),
                self.track_id,
            )? {
                Some((samples, _)) => {
                    self.leftover = samples;
                }
                None => {
                    self.finished = true;
                    return Ok(out.len() / channels);
                }
            }
        }
    }

    /// Seeks to an absolute source frame. The next chunk starts at exactly
    /// that frame: the container seek is coarse and the remainder is skipped
    /// during decode.
    pub fn seek_to_frame(&mut self, frame: u64) -> Result<(), SourceError> {
        self.leftover.clear();
        self.skip_frames = 0;
        self.finished = false;

        let time = Time::from(Duration::from_secs_f64(frame as f64 / self.sample_rate as f64));
        let seeked = self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        self.decoder.reset();

        if seeked.actual_ts < seeked.required_ts {
            self.skip_frames = seeked.required_ts - seeked.actual_ts;
        }
        Ok(())
    }

    /// Reads and decodes the next packet for our track. Handles ResetRequired
    /// by resetting the decoder and retrying. Returns `Ok(None)` on EOF.
    fn read_and_decode_next(
        format_reader: &mut dyn FormatReader,
        decoder: &mut dyn symphonia::core::codecs::Decoder,
        track_id: u32,
    ) -> Result<Option<(Vec<f32>, usize)>, SourceError> {
        loop {
            let packet = match format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                // Some decoders report EOF as a decode error.
                Err(SymphoniaError::DecodeError(_)) => return Ok(None),
                Err(e) => return Err(SourceError::Decode(e)),
            };
            if packet.track_id() != track_id {
                continue;
            }
            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    match decoder.decode(&packet) {
                        Ok(decoded) => decoded,
                        Err(e) => return Err(SourceError::Decode(e)),
                    }
                }
                Err(e) => return Err(SourceError::Decode(e)),
            };
            let (samples, channels) = Self::interleave_decoded(decoded);
            // Header packets can decode to zero PCM frames; keep reading.
            if channels > 0 && !samples.is_empty() {
                return Ok(Some((samples, channels)));
            }
        }
    }

    /// Converts a decoded buffer of any sample format to interleaved f32 and
    /// returns the channel count observed in the buffer.
    fn interleave_decoded(decoded: AudioBufferRef) -> (Vec<f32>, usize) {
        match decoded {
            AudioBufferRef::F32(buf) => Self::interleave(&buf, |s| s),
            AudioBufferRef::F64(buf) => Self::interleave(&buf, |s| s as f32),
            AudioBufferRef::S8(buf) => Self::interleave(&buf, Self::scale_s8),
            AudioBufferRef::S16(buf) => Self::interleave(&buf, Self::scale_s16),
            AudioBufferRef::S24(buf) => Self::interleave(&buf, |s| Self::scale_s24(s.inner())),
            AudioBufferRef::S32(buf) => Self::interleave(&buf, Self::scale_s32),
            AudioBufferRef::U8(buf) => Self::interleave(&buf, Self::scale_u8),
            AudioBufferRef::U16(buf) => Self::interleave(&buf, Self::scale_u16),
            AudioBufferRef::U24(buf) => Self::interleave(&buf, |s| Self::scale_u24(s.inner())),
            AudioBufferRef::U32(buf) => Self::interleave(&buf, Self::scale_u32),
        }
    }

    fn interleave<T, F>(buf: &AudioBuffer<T>, convert: F) -> (Vec<f32>, usize)
    where
        T: symphonia::core::sample::Sample,
        F: Fn(T) -> f32,
    {
        let frames = buf.frames();
        let channels = buf.spec().channels.count();
        let planes = buf.planes();
        let mut samples = Vec::with_capacity(frames * channels);
        for frame_idx in 0..frames {
            for ch_idx in 0..channels {
                samples.push(convert(planes.planes()[ch_idx][frame_idx]));
            }
        }
        (samples, channels)
    }

    // Scaling helpers for the integer sample formats.

    #[inline]
    pub(crate) fn scale_s8(sample: i8) -> f32 {
        sample as f32 / (1i64 << 7) as f32
    }

    #[inline]
    pub(crate) fn scale_s16(sample: i16) -> f32 {
        sample as f32 / (1i64 << 15) as f32
    }

    #[inline]
    pub(crate) fn scale_s24(sample: i32) -> f32 {
        sample as f32 / (1i64 << 23) as f32
    }

    #[inline]
    pub(crate) fn scale_s32(sample: i32) -> f32 {
        sample as f32 / (1i64 << 31) as f32
    }

    #[inline]
    pub(crate) fn scale_u8(sample: u8) -> f32 {
        (sample as f32 / u8::MAX as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u16(sample: u16) -> f32 {
        (sample as f32 / u16::MAX as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u24(sample: u32) -> f32 {
        let max = (1u32 << 24) - 1;
        (sample as f32 / max as f32) * 2.0 - 1.0
    }

    #[inline]
    pub(crate) fn scale_u32(sample: u32) -> f32 {
        (sample as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

/// Fully decodes a file into a preloaded PCM buffer.
pub fn decode_file<P: AsRef<Path>>(path: P) -> Result<TrackData, SourceError> {
    let mut stream = FileStream::open(path)?;
    let channels = stream.channels();
    let sample_rate = stream.sample_rate();

    let mut samples = Vec::new();
    let mut chunk = Vec::new();
    loop {
        let frames = stream.next_chunk(&mut chunk, 4096)?;
        if frames == 0 {
            break;
        }
        samples.extend_from_slice(&chunk);
    }

    Ok(TrackData::new(samples, channels, sample_rate))
}

/// Estimated decoded size in bytes, used to pick between preloading and
/// streaming when the caller asked for automatic selection.
pub fn estimated_decoded_bytes(stream: &FileStream) -> u64 {
    stream.duration_frames() * stream.channels() as u64 * std::mem::size_of::<f32>() as u64
}
