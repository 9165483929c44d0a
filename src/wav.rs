use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

const I16_MAX_F: f32 = 32768.0; // 2^15
const I24_MAX_F: f32 = 8388608.0; // 2^23
const I32_MAX_F: f32 = 2147483648.0; // 2^31
const U8_MAX_F: f32 = 128.0;

/// Frames kept past the furthest loop end when crop-to-loop is requested,
/// so the board never reads right up against the loop boundary.
const LOOP_CROP_MARGIN_FRAMES: u32 = 2000;

/// Holds format information from the 'fmt ' chunk.
#[derive(Debug, Clone, Copy)]
pub struct WavFmt {
    pub audio_format: u16, // 1 = PCM, 3 = IEEE Float
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Tuning and loop metadata decoded from 'smpl' and 'cue ' chunks.
#[derive(Debug, Clone, Default)]
pub struct SampleMetadata {
    pub unity_note: u32,
    pub pitch_fraction: u32,
    /// (start, end) sample offsets, in file order.
    pub loops: Vec<(u32, u32)>,
    pub cue_points: Vec<u32>,
}

impl SampleMetadata {
    /// The first declared loop, if any.
    pub fn loop_region(&self) -> Option<(u32, u32)> {
        self.loops.first().copied()
    }

    /// A unity note of 0 or >127 means the file declares no usable tuning.
    pub fn valid_unity_note(&self) -> Option<u8> {
        if (1..=127).contains(&self.unity_note) {
            Some(self.unity_note as u8)
        } else {
            None
        }
    }
}

/// Everything the chunk walk learns about a file without touching sample data.
#[derive(Debug, Clone)]
pub struct WavInfo {
    pub fmt: WavFmt,
    pub meta: SampleMetadata,
    /// Raw 'fmt ' payload, preserved verbatim for cropped copies.
    pub fmt_raw: Vec<u8>,
    /// Raw 'smpl' payload, if present.
    pub smpl_raw: Option<Vec<u8>>,
    pub data_offset: u64,
    pub data_size: u32,
}

/// Walks the RIFF chunks of a WAV file, buffering only 'fmt ', 'smpl' and
/// 'cue ' payloads and recording where the 'data' chunk lives.
pub fn read_wav_header<R: Read + Seek>(reader: &mut R, full_path_for_logs: &Path) -> Result<WavInfo> {
    let mut header = [0; 4];
    reader.read_exact(&mut header)?;
    if &header != b"RIFF" {
        return Err(anyhow!("Not a RIFF file (found {:?}): {:?}", header, full_path_for_logs));
    }

    let _file_size = reader.read_u32::<LittleEndian>()?;
    let mut wave_header = [0; 4];
    reader.read_exact(&mut wave_header)?;
    if &wave_header != b"WAVE" {
        return Err(anyhow!("Not a WAVE file: {:?}", full_path_for_logs));
    }

    let mut format_chunk: Option<WavFmt> = None;
    let mut fmt_raw: Vec<u8> = Vec::new();
    let mut smpl_raw: Option<Vec<u8>> = None;
    let mut meta = SampleMetadata::default();
    let mut data_chunk_info: Option<(u64, u32)> = None; // (offset, size)

    while let Ok(chunk_id) = reader.read_u32::<LittleEndian>().map(|id| id.to_le_bytes()) {
        let chunk_size = reader.read_u32::<LittleEndian>()?;
        let chunk_data_start_pos = reader.stream_position()?;
        let next_chunk_aligned_pos =
            chunk_data_start_pos + (chunk_size as u64 + ((chunk_size as u64) % 2));

        match &chunk_id {
            b"fmt " => {
                let mut fmt_data = vec![0; chunk_size as usize];
                reader.read_exact(&mut fmt_data)?;
                let mut cursor = Cursor::new(fmt_data.as_slice());
                format_chunk = Some(WavFmt {
                    audio_format: cursor.read_u16::<LittleEndian>()?,
                    num_channels: cursor.read_u16::<LittleEndian>()?,
                    sample_rate: cursor.read_u32::<LittleEndian>()?,
                    bits_per_sample: {
                        cursor.seek(SeekFrom::Start(14))?;
                        cursor.read_u16::<LittleEndian>()?
                    },
                });
                fmt_raw = fmt_data;
            }
            b"smpl" => {
                let mut smpl_data = vec![0; chunk_size as usize];
                reader.read_exact(&mut smpl_data)?;
                parse_smpl_chunk(&smpl_data, &mut meta);
                smpl_raw = Some(smpl_data);
            }
            b"cue " => {
                let mut cue_data = vec![0; chunk_size as usize];
                reader.read_exact(&mut cue_data)?;
                meta.cue_points = parse_cue_chunk(&cue_data);
            }
            b"data" => {
                data_chunk_info = Some((chunk_data_start_pos, chunk_size));
            }
            _ => {} // Skipped; the seek below steps past the payload
        }
        if reader.seek(SeekFrom::Start(next_chunk_aligned_pos)).is_err() {
            break; // Reached end of file
        }
    }

    let format = format_chunk
        .ok_or_else(|| anyhow!("File has no 'fmt ' chunk: {:?}", full_path_for_logs))?;
    let (data_offset, data_size) = data_chunk_info
        .ok_or_else(|| anyhow!("File has no 'data' chunk: {:?}", full_path_for_logs))?;

    Ok(WavInfo {
        fmt: format,
        meta,
        fmt_raw,
        smpl_raw,
        data_offset,
        data_size,
    })
}

/// Parses a 'smpl' chunk's payload into `meta`.
///
/// Layout: manufacturer(0), product(4), sample period(8), unity note(12),
/// pitch fraction(16), SMPTE format(20), SMPTE offset(24), loop count(28),
/// sampler data size(32), then 24-byte loop records from offset 36.
fn parse_smpl_chunk(data: &[u8], meta: &mut SampleMetadata) {
    if data.len() < 36 {
        log::warn!("[smpl] chunk too short for header: {} bytes", data.len());
        return;
    }
    let mut cursor = Cursor::new(data);

    let read_field = |cursor: &mut Cursor<&[u8]>, offset: u64| -> Option<u32> {
        cursor.seek(SeekFrom::Start(offset)).ok()?;
        cursor.read_u32::<LittleEndian>().ok()
    };

    meta.unity_note = read_field(&mut cursor, 12).unwrap_or(0);
    meta.pitch_fraction = read_field(&mut cursor, 16).unwrap_or(0);
    let num_loops = read_field(&mut cursor, 28).unwrap_or(0);

    for i in 0..num_loops as u64 {
        let base = 36 + i * 24;
        if (base + 24) as usize > data.len() {
            log::warn!("[smpl] chunk declares {} loops but is truncated", num_loops);
            break;
        }
        // cue id(+0), type(+4), start(+8), end(+12), fraction(+16), play count(+20)
        let start = match read_field(&mut cursor, base + 8) {
            Some(v) => v,
            None => break,
        };
        let end = match read_field(&mut cursor, base + 12) {
            Some(v) => v,
            None => break,
        };
        meta.loops.push((start, end));
    }
}

/// Parses a 'cue ' chunk's payload and returns the sample offsets, sorted.
fn parse_cue_chunk(data: &[u8]) -> Vec<u32> {
    let mut positions = Vec::new();

    if data.len() < 4 {
        return positions;
    }
    let mut cursor = Cursor::new(data);

    let num_points = match cursor.read_u32::<LittleEndian>() {
        Ok(n) => n,
        Err(_) => return positions,
    };

    // Each cue point record is 24 bytes; dwSampleOffset at +20 is the
    // reliable field for PCM.
    for _ in 0..num_points {
        let current_pos = cursor.position();
        if (data.len() as u64 - current_pos) < 24 {
            break;
        }
        if cursor.seek(SeekFrom::Current(20)).is_err() {
            break;
        }
        let sample_offset = match cursor.read_u32::<LittleEndian>() {
            Ok(n) => n,
            Err(_) => break,
        };
        positions.push(sample_offset);
    }

    positions.sort();
    positions
}

/// Helper to read a 24-bit sample from a reader.
fn read_i24<R: Read>(reader: &mut R) -> std::io::Result<i32> {
    let b1 = reader.read_u8()? as i32;
    let b2 = reader.read_u8()? as i32;
    let b3 = reader.read_u8()? as i32;
    // Combine, then sign-extend from 24th bit
    let sample = (b1 | (b2 << 8) | (b3 << 16)) << 8 >> 8;
    Ok(sample)
}

/// Reads the whole 'data' chunk into one normalized f32 wave per channel.
pub fn read_samples<R: Read + Seek>(reader: &mut R, info: &WavInfo) -> Result<Vec<Vec<f32>>> {
    let fmt = info.fmt;
    if fmt.num_channels == 0 || fmt.bits_per_sample == 0 {
        return Err(anyhow!(
            "Degenerate 'fmt ' chunk: {} channels, {} bits",
            fmt.num_channels,
            fmt.bits_per_sample
        ));
    }
    reader.seek(SeekFrom::Start(info.data_offset))?;

    let bytes_per_sample = (fmt.bits_per_sample / 8) as u32;
    let num_frames = info.data_size / (bytes_per_sample * fmt.num_channels as u32);
    let num_channels = fmt.num_channels as usize;
    let mut waves = vec![Vec::with_capacity(num_frames as usize); num_channels];

    for _ in 0..num_frames {
        for ch in 0..num_channels {
            let sample_f32 = match (fmt.audio_format, fmt.bits_per_sample) {
                (1, 8) => (reader.read_u8()? as f32 - U8_MAX_F) / U8_MAX_F, // 8-bit is unsigned
                (1, 16) => (reader.read_i16::<LittleEndian>()? as f32) / I16_MAX_F,
                (1, 24) => (read_i24(reader)? as f32) / I24_MAX_F,
                (1, 32) => (reader.read_i32::<LittleEndian>()? as f32) / I32_MAX_F,
                (3, 32) => reader.read_f32::<LittleEndian>()?,
                _ => {
                    return Err(anyhow!(
                        "Unsupported read format: {}/{}",
                        fmt.audio_format,
                        fmt.bits_per_sample
                    ));
                }
            };
            waves[ch].push(sample_f32);
        }
    }
    Ok(waves)
}

/// Opens a recording and returns its format, metadata and decoded channels.
pub fn load_sample(path: &Path) -> Result<(WavFmt, SampleMetadata, Vec<Vec<f32>>)> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut reader = BufReader::new(file);
    let info = read_wav_header(&mut reader, path)?;
    let waves = read_samples(&mut reader, &info)?;
    Ok((info.fmt, info.meta, waves))
}

/// Writes a rendered bank track: 16-bit PCM stereo with a single synthetic
/// loop spanning the whole buffer, so the playback board treats the file as
/// sustain-capable even though it was rendered to a fixed length.
pub fn write_render_wav(path: &Path, pcm: &[i16], sample_rate: u32) -> Result<()> {
    const FMT_SIZE: u32 = 16;
    const SMPL_SIZE: u32 = 60; // 36-byte header + one 24-byte loop
    const CHANNELS: u16 = 2;
    const BITS: u16 = 16;

    let frames = (pcm.len() / CHANNELS as usize) as u32;
    let data_size = (pcm.len() * 2) as u32;
    let block_align = CHANNELS * (BITS / 8);

    // "WAVE" + (fmt + smpl + data headers and payloads); equals file size - 8
    let riff_size = 4 + (8 + FMT_SIZE) + (8 + SMPL_SIZE) + (8 + data_size);

    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);

    writer.write_all(b"RIFF")?;
    writer.write_u32::<LittleEndian>(riff_size)?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_u32::<LittleEndian>(FMT_SIZE)?;
    writer.write_u16::<LittleEndian>(1)?; // PCM
    writer.write_u16::<LittleEndian>(CHANNELS)?;
    writer.write_u32::<LittleEndian>(sample_rate)?;
    writer.write_u32::<LittleEndian>(sample_rate * block_align as u32)?;
    writer.write_u16::<LittleEndian>(block_align)?;
    writer.write_u16::<LittleEndian>(BITS)?;

    writer.write_all(b"smpl")?;
    writer.write_u32::<LittleEndian>(SMPL_SIZE)?;
    writer.write_u32::<LittleEndian>(0)?; // manufacturer
    writer.write_u32::<LittleEndian>(0)?; // product
    writer.write_u32::<LittleEndian>(1_000_000_000 / sample_rate)?; // sample period (ns)
    writer.write_u32::<LittleEndian>(60)?; // unity note
    writer.write_u32::<LittleEndian>(0)?; // pitch fraction
    writer.write_u32::<LittleEndian>(0)?; // SMPTE format
    writer.write_u32::<LittleEndian>(0)?; // SMPTE offset
    writer.write_u32::<LittleEndian>(1)?; // one loop
    writer.write_u32::<LittleEndian>(0)?; // sampler data size
    writer.write_u32::<LittleEndian>(0)?; // loop cue id
    writer.write_u32::<LittleEndian>(0)?; // loop type: forward
    writer.write_u32::<LittleEndian>(0)?; // loop start
    writer.write_u32::<LittleEndian>(frames)?; // loop end (exclusive, spans whole buffer)
    writer.write_u32::<LittleEndian>(0)?; // loop fraction
    writer.write_u32::<LittleEndian>(0)?; // play count: infinite

    writer.write_all(b"data")?;
    writer.write_u32::<LittleEndian>(data_size)?;
    for &sample in pcm {
        writer.write_i16::<LittleEndian>(sample)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes a truncated copy of a source recording for fast preview loading.
///
/// 'fmt ' and 'smpl' are preserved verbatim; 'data' is cut to the smaller of
/// the explicit frame cap and (when `crop_to_loops` is set) the furthest
/// declared loop end plus a safety margin.
pub fn write_cropped_copy(
    src: &Path,
    dst: &Path,
    max_frames: Option<u32>,
    crop_to_loops: bool,
) -> Result<()> {
    let file = File::open(src).with_context(|| format!("Failed to open {:?}", src))?;
    let mut reader = BufReader::new(file);
    let info = read_wav_header(&mut reader, src)?;

    let block_align = (info.fmt.bits_per_sample / 8) as u32 * info.fmt.num_channels as u32;
    if block_align == 0 {
        return Err(anyhow!("Degenerate 'fmt ' chunk in {:?}", src));
    }
    let total_frames = info.data_size / block_align;

    let mut cap = max_frames.unwrap_or(total_frames);
    if crop_to_loops {
        if let Some(furthest_end) = info.meta.loops.iter().map(|&(_, end)| end).max() {
            cap = cap.min(furthest_end.saturating_add(LOOP_CROP_MARGIN_FRAMES));
        }
    }
    cap = cap.min(total_frames);
    let new_data_size = cap * block_align;

    let chunk_span = |len: u32| 8 + len + len % 2;
    let mut riff_size = 4 + chunk_span(info.fmt_raw.len() as u32) + chunk_span(new_data_size);
    if let Some(smpl) = &info.smpl_raw {
        riff_size += chunk_span(smpl.len() as u32);
    }

    let out_file = File::create(dst).with_context(|| format!("Failed to create {:?}", dst))?;
    let mut writer = BufWriter::new(out_file);

    writer.write_all(b"RIFF")?;
    writer.write_u32::<LittleEndian>(riff_size)?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_u32::<LittleEndian>(info.fmt_raw.len() as u32)?;
    writer.write_all(&info.fmt_raw)?;
    if info.fmt_raw.len() % 2 != 0 {
        writer.write_u8(0)?;
    }

    if let Some(smpl) = &info.smpl_raw {
        writer.write_all(b"smpl")?;
        writer.write_u32::<LittleEndian>(smpl.len() as u32)?;
        writer.write_all(smpl)?;
        if smpl.len() % 2 != 0 {
            writer.write_u8(0)?;
        }
    }

    writer.write_all(b"data")?;
    writer.write_u32::<LittleEndian>(new_data_size)?;
    reader.seek(SeekFrom::Start(info.data_offset))?;
    let mut limited = (&mut reader).take(new_data_size as u64);
    let copied = std::io::copy(&mut limited, &mut writer)?;
    if copied != new_data_size as u64 {
        return Err(anyhow!(
            "Short read while cropping {:?}: wanted {} bytes, got {}",
            src,
            new_data_size,
            copied
        ));
    }
    if new_data_size % 2 != 0 {
        writer.write_u8(0)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn synthetic_smpl(unity: u32, fraction: u32, loops: &[(u32, u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(0).unwrap(); // manufacturer
        data.write_u32::<LittleEndian>(0).unwrap(); // product
        data.write_u32::<LittleEndian>(22675).unwrap(); // sample period
        data.write_u32::<LittleEndian>(unity).unwrap();
        data.write_u32::<LittleEndian>(fraction).unwrap();
        data.write_u32::<LittleEndian>(0).unwrap(); // SMPTE format
        data.write_u32::<LittleEndian>(0).unwrap(); // SMPTE offset
        data.write_u32::<LittleEndian>(loops.len() as u32).unwrap();
        data.write_u32::<LittleEndian>(0).unwrap(); // sampler data
        for (i, &(start, end)) in loops.iter().enumerate() {
            data.write_u32::<LittleEndian>(i as u32).unwrap();
            data.write_u32::<LittleEndian>(0).unwrap();
            data.write_u32::<LittleEndian>(start).unwrap();
            data.write_u32::<LittleEndian>(end).unwrap();
            data.write_u32::<LittleEndian>(0).unwrap();
            data.write_u32::<LittleEndian>(0).unwrap();
        }
        data
    }

    #[test]
    fn smpl_chunk_decodes_tuning_and_loops() {
        let data = synthetic_smpl(57, 0x8000_0000, &[(100, 4000), (10, 50)]);
        let mut meta = SampleMetadata::default();
        parse_smpl_chunk(&data, &mut meta);
        assert_eq!(meta.unity_note, 57);
        assert_eq!(meta.pitch_fraction, 0x8000_0000);
        assert_eq!(meta.loops, vec![(100, 4000), (10, 50)]);
        assert_eq!(meta.valid_unity_note(), Some(57));
    }

    #[test]
    fn smpl_unity_note_zero_is_invalid() {
        let data = synthetic_smpl(0, 0, &[]);
        let mut meta = SampleMetadata::default();
        parse_smpl_chunk(&data, &mut meta);
        assert_eq!(meta.valid_unity_note(), None);
        assert!(meta.loop_region().is_none());
    }

    #[test]
    fn cue_chunk_offsets_are_sorted() {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(2).unwrap();
        for offset in [9000u32, 150] {
            data.write_u32::<LittleEndian>(1).unwrap(); // name
            data.write_u32::<LittleEndian>(0).unwrap(); // position
            data.extend_from_slice(b"data");
            data.write_u32::<LittleEndian>(0).unwrap(); // chunk start
            data.write_u32::<LittleEndian>(0).unwrap(); // block start
            data.write_u32::<LittleEndian>(offset).unwrap();
        }
        assert_eq!(parse_cue_chunk(&data), vec![150, 9000]);
    }

    #[test]
    fn render_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0042.wav");
        let pcm: Vec<i16> = (0..2000).map(|i| (i % 256) as i16 * 100).collect();
        write_render_wav(&path, &pcm, 44100).unwrap();

        let (fmt, meta, waves) = load_sample(&path).unwrap();
        assert_eq!(fmt.audio_format, 1);
        assert_eq!(fmt.num_channels, 2);
        assert_eq!(fmt.sample_rate, 44100);
        assert_eq!(fmt.bits_per_sample, 16);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 1000);
        // The synthetic loop spans the whole buffer; the end bound is
        // exclusive so the last frame is inside the loop.
        assert_eq!(meta.loop_region(), Some((0, 1000)));
        assert_eq!(meta.unity_note, 60);
        // Spot-check sample values survive quantized storage exactly.
        assert!((waves[0][3] - (pcm[6] as f32 / I16_MAX_F)).abs() < 1e-6);
    }

    #[test]
    fn riff_size_field_matches_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size.wav");
        write_render_wav(&path, &[0i16; 64], 44100).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(declared as usize, bytes.len() - 8);
    }

    #[test]
    fn missing_fmt_chunk_is_a_hard_error() {
        let mut bogus = Vec::new();
        bogus.extend_from_slice(b"RIFF");
        bogus.write_u32::<LittleEndian>(12).unwrap();
        bogus.extend_from_slice(b"WAVE");
        bogus.extend_from_slice(b"data");
        bogus.write_u32::<LittleEndian>(0).unwrap();
        let mut cursor = Cursor::new(bogus);
        assert!(read_wav_header(&mut cursor, Path::new("bogus.wav")).is_err());
    }

    #[test]
    fn non_riff_signature_is_rejected() {
        let mut cursor = Cursor::new(b"NOPE----WAVE".to_vec());
        assert!(read_wav_header(&mut cursor, Path::new("bogus.wav")).is_err());
    }

    #[test]
    fn cropped_copy_truncates_data_and_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.wav");
        let dst = dir.path().join("dst.wav");
        let pcm: Vec<i16> = vec![1234; 5000 * 2];
        write_render_wav(&src, &pcm, 44100).unwrap();

        write_cropped_copy(&src, &dst, Some(100), false).unwrap();

        let (fmt, meta, waves) = load_sample(&dst).unwrap();
        assert_eq!(waves[0].len(), 100);
        assert_eq!(fmt.sample_rate, 44100);
        // smpl preserved verbatim, so it still declares the original span.
        assert_eq!(meta.loop_region(), Some((0, 5000)));

        let bytes = std::fs::read(&dst).unwrap();
        let declared = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(declared as usize, bytes.len() - 8);
    }

    #[test]
    fn crop_to_loop_caps_at_loop_end_plus_margin() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.wav");
        let dst = dir.path().join("dst.wav");
        // 10000 frames; the synthetic loop end is 10000, so the margin cap
        // exceeds the file and the copy keeps everything.
        write_render_wav(&src, &vec![7i16; 10000 * 2], 44100).unwrap();
        write_cropped_copy(&src, &dst, None, true).unwrap();
        let (_, _, waves) = load_sample(&dst).unwrap();
        assert_eq!(waves[0].len(), 10000);
    }
}
