//! Splitting of requests larger than what a backend accepts in one go.

use crate::command::{Destination, Source, TransferRequest};
use crate::device::{TextureFormat, TextureRegion};

/// Sub-range `[offset, offset + len)` of a request source.
fn sub_source(source: &Source, offset: u64, len: u64) -> Source {
    match source {
        Source::File { file, offset: base } => Source::File {
            file: file.clone(),
            offset: base + offset,
        },
        Source::Memory(bytes) => Source::Memory(bytes.slice(offset as usize..(offset + len) as usize)),
    }
}

/// Splits `request` into requests of at most `max_size` bytes that
/// together cover exactly the original request, in ascending offset
/// order.
///
/// Buffer and host memory destinations are split at arbitrary byte
/// boundaries. Texture regions are split into whole depth planes when a
/// plane fits, otherwise into whole rows of blocks.
///
/// # Panics
/// If a single block row of a texture region is larger than `max_size`.
pub fn split_request(request: TransferRequest, max_size: u64) -> Vec<TransferRequest> {
    assert!(max_size > 0, "maximum request size must not be zero");

    if request.len() <= max_size {
        return vec![request];
    }

    match &request.destination {
        Destination::Memory { buffer, offset } => byte_chunks(request.len(), max_size)
            .map(|(at, len)| {
                TransferRequest::new(
                    sub_source(&request.source, at, len),
                    Destination::Memory {
                        buffer: buffer.clone(),
                        offset: offset + at,
                    },
                    len,
                )
            })
            .collect(),
        Destination::Buffer { buffer, offset } => byte_chunks(request.len(), max_size)
            .map(|(at, len)| {
                TransferRequest::new(
                    sub_source(&request.source, at, len),
                    Destination::Buffer {
                        buffer: buffer.clone(),
                        offset: offset + at,
                    },
                    len,
                )
            })
            .collect(),
        Destination::Texture { texture, region } => split_region(region, texture.format(), max_size)
            .into_iter()
            .map(|(at, sub)| {
                let len = sub.byte_size(texture.format());
                TransferRequest::new(
                    sub_source(&request.source, at, len),
                    Destination::Texture {
                        texture: texture.clone(),
                        region: sub,
                    },
                    len,
                )
            })
            .collect(),
    }
}

fn byte_chunks(len: u64, max_size: u64) -> impl Iterator<Item = (u64, u64)> {
    (0..len)
        .step_by(max_size as usize)
        .map(move |at| (at, max_size.min(len - at)))
}

/// Splits `region` into sub-regions of at most `max_size` packed bytes.
/// Returns each sub-region with its offset inside the packed data of the
/// whole region.
fn split_region(
    region: &TextureRegion,
    format: TextureFormat,
    max_size: u64,
) -> Vec<(u64, TextureRegion)> {
    let plane = region.plane_size(format);

    if plane <= max_size {
        let planes = (max_size / plane) as u32;
        return (0..region.depth)
            .step_by(planes as usize)
            .map(|z| {
                let sub = TextureRegion {
                    z: region.z + z,
                    depth: planes.min(region.depth - z),
                    ..*region
                };
                (z as u64 * plane, sub)
            })
            .collect();
    }

    let pitch = format.row_pitch(region.width);
    assert!(
        pitch <= max_size,
        "row of {} bytes of region {:?} does not fit maximum request size {}",
        pitch,
        region,
        max_size
    );

    let rows_per = (max_size / pitch) as u32;
    let total_rows = format.block_rows(region.height);
    let mut out = Vec::new();
    for z in 0..region.depth {
        for row in (0..total_rows).step_by(rows_per as usize) {
            let rows = rows_per.min(total_rows - row);
            let y = row * format.block_height;
            let sub = TextureRegion {
                y: region.y + y,
                z: region.z + z,
                height: (rows * format.block_height).min(region.height - y),
                depth: 1,
                ..*region
            };
            out.push((z as u64 * plane + row as u64 * pitch, sub));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::command::{Destination, HostBuffer, Source, TransferRequest};
    use crate::device::{DeviceBuffer, DeviceTexture, TextureFormat, TextureRegion};
    use crate::split::split_request;
    use bytes::Bytes;
    use quickcheck_macros::quickcheck;

    const MIB: u64 = 1024 * 1024;

    fn dst_offset(request: &TransferRequest) -> u64 {
        match &request.destination {
            Destination::Buffer { offset, .. } | Destination::Memory { offset, .. } => *offset,
            Destination::Texture { .. } => panic!("not a linear destination"),
        }
    }

    #[test]
    fn ten_mib_into_three_pieces() {
        let buffer = DeviceBuffer::new("b", 10 * MIB as usize);
        let request = TransferRequest::memory_to_buffer(Bytes::from(vec![0u8; 10 * MIB as usize]), &buffer, 0);

        let pieces = split_request(request, 4 * MIB);

        let spans = pieces.iter().map(|r| (dst_offset(r), r.len())).collect::<Vec<_>>();
        assert_eq!(spans, vec![(0, 4 * MIB), (4 * MIB, 4 * MIB), (8 * MIB, 2 * MIB)]);
    }

    #[test]
    fn small_request_is_kept() {
        let host = HostBuffer::new("h", 16);
        let request = TransferRequest::memory_to_memory(Bytes::from_static(&[1; 16]), &host, 0);

        assert_eq!(split_request(request, 16).len(), 1);
    }

    #[quickcheck]
    fn linear_split_covers_range(len: u16, max: u8, base: u8) -> bool {
        let len = len as u64 + 1;
        let max = max as u64 + 1;
        let base = base as u64;
        let data = (0..len).map(|i| i as u8).collect::<Vec<_>>();
        let host = HostBuffer::new("h", (base + len) as usize);
        let request = TransferRequest::memory_to_memory(Bytes::from(data.clone()), &host, base);

        let pieces = split_request(request, max);

        let mut cursor = base;
        let mut joined = Vec::new();
        for piece in pieces.iter() {
            if dst_offset(piece) != cursor || piece.len() > max {
                return false;
            }
            cursor += piece.len();
            match &piece.source {
                Source::Memory(bytes) => joined.extend_from_slice(bytes),
                Source::File { .. } => return false,
            }
        }
        cursor == base + len && joined == data
    }

    #[test]
    fn texture_split_by_planes() {
        let texture = DeviceTexture::new("t", TextureFormat::RGBA8, [4, 4, 4], 1);
        let region = texture.mip_region(0);
        let request = TransferRequest::memory_to_texture(Bytes::from(vec![0u8; 256]), &texture, region);

        let pieces = split_request(request, 128);

        assert_eq!(pieces.len(), 2);
        match (&pieces[0].destination, &pieces[1].destination) {
            (Destination::Texture { region: a, .. }, Destination::Texture { region: b, .. }) => {
                assert_eq!((a.z, a.depth), (0, 2));
                assert_eq!((b.z, b.depth), (2, 2));
            }
            _ => panic!("expected texture destinations"),
        }
    }

    #[test]
    fn compressed_texture_split_by_block_rows() {
        // 12x10 BC1: 3 blocks per row (24 bytes), 3 block rows
        let texture = DeviceTexture::new("t", TextureFormat::BC1, [12, 10, 1], 1);
        let region = texture.mip_region(0);
        let data = (0..72u8).collect::<Vec<_>>();
        let request = TransferRequest::memory_to_texture(Bytes::from(data.clone()), &texture, region);

        let pieces = split_request(request, 50);

        let regions = pieces
            .iter()
            .map(|p| match &p.destination {
                Destination::Texture { region, .. } => *region,
                _ => panic!("expected texture destination"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            regions,
            vec![
                TextureRegion { y: 0, height: 8, ..region },
                TextureRegion { y: 8, height: 2, ..region },
            ]
        );
        let joined = pieces
            .iter()
            .flat_map(|p| match &p.source {
                Source::Memory(bytes) => bytes.to_vec(),
                Source::File { .. } => unreachable!(),
            })
            .collect::<Vec<_>>();
        assert_eq!(joined, data);
    }

    #[test]
    #[should_panic]
    fn texture_row_larger_than_max_panics() {
        let texture = DeviceTexture::new("t", TextureFormat::RGBA8, [64, 2, 1], 1);
        let region = texture.mip_region(0);
        let request = TransferRequest::memory_to_texture(Bytes::from(vec![0u8; 512]), &texture, region);

        split_request(request, 100);
    }
}
