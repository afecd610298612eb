//! H.265 Annex-B file source, replayed in a loop at a fixed frame rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camserver::media::h265::nal_type;
use camserver::{CaptureSink, FrameFlags, MediaKind, Server};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const NAL_AUD: u8 = 35;
const NAL_PREFIX_SEI: u8 = 39;

/// Split an Annex-B buffer into NAL units, start codes stripped.
fn split_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut start = None;
    let mut i = 0;

    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                let mut end = i;
                // 4-byte start code: the leading zero belongs to it
                if end > s && data[end - 1] == 0 {
                    end -= 1;
                }
                nals.push(&data[s..end]);
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start
        && s < data.len()
    {
        nals.push(&data[s..]);
    }

    nals.retain(|nal| nal.len() >= 2);
    nals
}

pub struct AccessUnit {
    pub data: Vec<u8>,
    pub key_frame: bool,
}

/// A parsed elementary stream: the first VPS/SPS/PPS seen plus every
/// access unit in decode order.
pub struct ElementaryStream {
    parameter_sets: Vec<u8>,
    access_units: Vec<AccessUnit>,
}

impl ElementaryStream {
    /// Returns `None` if the stream lacks a parameter set or any picture.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut vps = None;
        let mut sps = None;
        let mut pps = None;

        let mut access_units = Vec::new();
        let mut current = AccessUnit {
            data: Vec::new(),
            key_frame: false,
        };
        let mut has_picture = false;

        for nal in split_nals(data) {
            let kind = nal_type(nal[0]);
            match kind {
                NAL_VPS => {
                    vps.get_or_insert(nal);
                }
                NAL_SPS => {
                    sps.get_or_insert(nal);
                }
                NAL_PPS => {
                    pps.get_or_insert(nal);
                }
                _ => {}
            }

            let is_vcl = kind < 32;
            let first_slice = is_vcl && nal.len() > 2 && nal[2] & 0x80 != 0;
            let opens_unit = matches!(kind, NAL_VPS..=NAL_AUD | NAL_PREFIX_SEI) || first_slice;

            if has_picture && opens_unit {
                access_units.push(std::mem::replace(
                    &mut current,
                    AccessUnit {
                        data: Vec::new(),
                        key_frame: false,
                    },
                ));
                has_picture = false;
            }

            current.data.extend_from_slice(&START_CODE);
            current.data.extend_from_slice(nal);
            if is_vcl {
                has_picture = true;
                // BLA, IDR and CRA pictures
                current.key_frame |= (16..=21).contains(&kind);
            }
        }
        if has_picture {
            access_units.push(current);
        }

        let mut parameter_sets = Vec::new();
        for nal in [vps?, sps?, pps?] {
            parameter_sets.extend_from_slice(&START_CODE);
            parameter_sets.extend_from_slice(nal);
        }

        if access_units.is_empty() {
            return None;
        }
        Some(ElementaryStream {
            parameter_sets,
            access_units,
        })
    }

    pub fn parameter_sets(&self) -> &[u8] {
        &self.parameter_sets
    }

    pub fn len(&self) -> usize {
        self.access_units.len()
    }
}

/// Feeds the stream into `server` until `running` is cleared, then closes
/// the video source.
pub fn spawn_feeder(
    server: Arc<Server>,
    stream: ElementaryStream,
    fps: u32,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let interval = Duration::from_secs(1) / fps.max(1);

    thread::Builder::new()
        .name("h265-feeder".into())
        .spawn(move || {
            let mut pts: i64 = 0;
            let mut next = Instant::now();

            'replay: while running.load(Ordering::SeqCst) {
                for unit in &stream.access_units {
                    if !running.load(Ordering::SeqCst) {
                        break 'replay;
                    }
                    let flags = FrameFlags {
                        key_frame: unit.key_frame,
                        codec_config: false,
                    };
                    server.on_frame_received(&unit.data, pts, flags, MediaKind::Video);
                    pts += interval.as_micros() as i64;

                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                tracing::debug!(frames = stream.len(), "stream looped");
            }

            server.on_source_closed(MediaKind::Video);
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(header: [u8; 2], body: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(body);
        out
    }

    fn sample_stream() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(nal([0x40, 0x01], &[0x0c]));
        data.extend(nal([0x42, 0x01], &[0x01]));
        data.extend(nal([0x44, 0x01], &[0xc1]));
        // IDR_W_RADL, two slices
        data.extend(nal([0x26, 0x01], &[0x80, 0xaa]));
        data.extend(nal([0x26, 0x01], &[0x00, 0xbb]));
        // TRAIL_R, 3-byte start code
        data.extend_from_slice(&[0, 0, 1, 0x02, 0x01, 0x80, 0xcc]);
        data.extend(nal([0x02, 0x01], &[0x80, 0xdd]));
        data
    }

    #[test]
    fn test_split_strips_start_codes() {
        let data = sample_stream();
        let nals = split_nals(&data);
        assert_eq!(nals.len(), 7);
        assert_eq!(nals[0], &[0x40, 0x01, 0x0c]);
        assert_eq!(nals[5], &[0x02, 0x01, 0x80, 0xcc]);
    }

    #[test]
    fn test_access_units_grouped_by_first_slice() {
        let stream = ElementaryStream::parse(&sample_stream()).unwrap();
        assert_eq!(stream.len(), 3);

        let first = &stream.access_units[0];
        assert!(first.key_frame);
        // Parameter sets stay in-band ahead of the IDR
        assert_eq!(split_nals(&first.data).len(), 5);

        assert!(!stream.access_units[1].key_frame);
        assert_eq!(split_nals(&stream.access_units[2].data), vec![&[0x02, 0x01, 0x80, 0xdd][..]]);
    }

    #[test]
    fn test_parameter_sets_collected() {
        let stream = ElementaryStream::parse(&sample_stream()).unwrap();
        let sets = split_nals(stream.parameter_sets());
        let kinds: Vec<u8> = sets.iter().map(|n| nal_type(n[0])).collect();
        assert_eq!(kinds, vec![NAL_VPS, NAL_SPS, NAL_PPS]);
    }

    #[test]
    fn test_stream_without_parameter_sets_rejected() {
        let data = nal([0x26, 0x01], &[0x80, 0xaa]);
        assert!(ElementaryStream::parse(&data).is_none());
    }
}
