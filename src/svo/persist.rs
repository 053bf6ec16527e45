//! Persisted tree and brick formats.
//!
//! The tree file is a fixed header plus one flat little-endian `i32` array
//! consumed by a parent-first recursive walk. Per node: a child-presence
//! bitmask, a segment-presence count (0 or 1), the segment's id / 64-bit
//! brick file offset (two words, low first) / byte length if present, then
//! the present children's records in child-id order.
//!
//! Brick records live in a separate file: a 4-byte compressed-size prefix
//! followed by an LZ4 block holding a fixed header and the three channel
//! buffers at crop resolution. Saving writes records for segments whose
//! channel data is resident; everything else is marked voxelize-on-demand.

use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::core::types::IVec3;
use crate::core::{Error, Result};
use crate::math::Aabb;
use crate::segment::brick::{BrickChannels, CropInfo, BRICK_DIM, BRICK_VOXELS};
use crate::segment::pool::BrickBufferPool;
use crate::segment::segment::BrickPayload;
use crate::segment::Segment;

use super::arena::NodeId;
use super::tree::SvoTree;

/// Voxel channel encoding of a persisted data set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8,
    /// Channel data stored with red and blue swapped; swapped back on load.
    Bgra8,
}

impl TextureFormat {
    pub fn tag(self) -> u32 {
        match self {
            TextureFormat::Rgba8 => 0,
            TextureFormat::Bgra8 => 1,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(TextureFormat::Rgba8),
            1 => Ok(TextureFormat::Bgra8),
            other => Err(Error::Corrupt(format!("unknown texture format tag {}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct TreeFileHeader {
    format_tag: u32,
    flags: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct BrickRecordHeader {
    segment_id: i32,
    _reserved: i32,
    box_min: [f32; 3],
    box_max: [f32; 3],
    crop_size: [i32; 3],
    crop_min: [i32; 3],
}

/// Upper bound on a sane compressed brick payload (four raw channels).
const MAX_COMPRESSED: usize = BRICK_VOXELS * 4 * 4;

/// Serialize one segment's resident brick data into a stream record.
pub fn build_brick_record(segment: &Segment, format: TextureFormat) -> Vec<u8> {
    let crop = segment.crop;
    let volume = crop.volume();

    let header = BrickRecordHeader {
        segment_id: segment.id as i32,
        _reserved: 0,
        box_min: segment.bounds_os.min.to_array(),
        box_max: segment.bounds_os.max.to_array(),
        crop_size: [crop.size.x as i32, crop.size.y as i32, crop.size.z as i32],
        crop_min: [crop.min.x as i32, crop.min.y as i32, crop.min.z as i32],
    };

    let mut body = Vec::with_capacity(std::mem::size_of::<BrickRecordHeader>() + volume * 12);
    body.extend_from_slice(bytemuck::bytes_of(&header));

    if let Some(channels) = &segment.channels {
        for channel in [&*channels.opacity, &*channels.normal, &*channels.albedo] {
            debug_assert_eq!(channel.len(), volume);
            for texel in channel {
                let t = match format {
                    TextureFormat::Rgba8 => *texel,
                    TextureFormat::Bgra8 => [texel[2], texel[1], texel[0], texel[3]],
                };
                body.extend_from_slice(&t);
            }
        }
    }

    let compressed = lz4_flex::compress_prepend_size(&body);
    let mut record = Vec::with_capacity(4 + compressed.len());
    record.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    record.extend_from_slice(&compressed);
    record
}

/// Decode a stream record into a brick payload.
///
/// All failure modes here are the fatal corruption class: the record came
/// from a file offset the tree itself handed out.
pub fn parse_brick_record(
    bytes: &[u8],
    format: TextureFormat,
    expected_id: u32,
    pool: &std::sync::Arc<BrickBufferPool>,
) -> Result<BrickPayload> {
    if bytes.len() < 4 {
        return Err(Error::Corrupt("brick record shorter than size prefix".into()));
    }
    let compressed_size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if compressed_size > MAX_COMPRESSED || compressed_size != bytes.len() - 4 {
        return Err(Error::Corrupt(format!(
            "brick record size {} out of bounds ({} read)",
            compressed_size,
            bytes.len()
        )));
    }

    let body = lz4_flex::decompress_size_prepended(&bytes[4..])
        .map_err(|e| Error::Corrupt(format!("brick decompression failed: {}", e)))?;

    let header_size = std::mem::size_of::<BrickRecordHeader>();
    if body.len() < header_size {
        return Err(Error::Corrupt("brick record truncated before header".into()));
    }
    let header: BrickRecordHeader = bytemuck::pod_read_unaligned(&body[..header_size]);

    if header.segment_id != expected_id as i32 {
        return Err(Error::Corrupt(format!(
            "brick record for segment {} found where {} was expected",
            header.segment_id, expected_id
        )));
    }

    for d in 0..3 {
        let size = header.crop_size[d];
        let min = header.crop_min[d];
        if size < 0 || min < 0 || (min + size) as usize > BRICK_DIM {
            return Err(Error::Corrupt("brick crop outside brick bounds".into()));
        }
    }

    let crop = CropInfo {
        min: glam::UVec3::new(
            header.crop_min[0] as u32,
            header.crop_min[1] as u32,
            header.crop_min[2] as u32,
        ),
        size: glam::UVec3::new(
            header.crop_size[0] as u32,
            header.crop_size[1] as u32,
            header.crop_size[2] as u32,
        ),
    };
    let volume = crop.volume();

    if volume == 0 {
        return Ok(BrickPayload {
            channels: None,
            crop: CropInfo::default(),
            max_alpha: 0.0,
            voxel_count: 0,
        });
    }

    if body.len() != header_size + volume * 4 * 3 {
        return Err(Error::Corrupt(format!(
            "brick record carries {} bytes for crop volume {}",
            body.len() - header_size,
            volume
        )));
    }

    let mut channels = BrickChannels::allocate(pool);
    let mut max_alpha = 0u8;
    let mut voxel_count = 0u32;

    for (c, channel) in [
        &mut channels.opacity,
        &mut channels.normal,
        &mut channels.albedo,
    ]
    .into_iter()
    .enumerate()
    {
        let base = header_size + c * volume * 4;
        for i in 0..volume {
            let raw = &body[base + i * 4..base + i * 4 + 4];
            let texel = match format {
                TextureFormat::Rgba8 => [raw[0], raw[1], raw[2], raw[3]],
                TextureFormat::Bgra8 => [raw[2], raw[1], raw[0], raw[3]],
            };
            channel[i] = texel;
            if c == 0 {
                if texel[0] != 0 || texel[1] != 0 || texel[2] != 0 {
                    voxel_count += 1;
                }
                max_alpha = max_alpha.max(texel[0]).max(texel[1]).max(texel[2]);
            }
        }
        channel.truncate(volume);
    }

    Ok(BrickPayload {
        channels: Some(channels),
        crop,
        max_alpha: max_alpha as f32 / 255.0,
        voxel_count,
    })
}

/// Save the tree topology and all resident brick data.
pub fn save(
    tree: &SvoTree,
    format: TextureFormat,
    tree_path: &Path,
    brick_path: &Path,
) -> Result<()> {
    let mut ints: Vec<i32> = Vec::new();
    let mut bricks: Vec<u8> = Vec::new();
    emit_node(tree, tree.root(), format, &mut ints, &mut bricks);

    let header = TreeFileHeader {
        format_tag: format.tag(),
        flags: 0,
    };

    let mut file: Vec<u8> = Vec::with_capacity(12 + ints.len() * 4);
    file.extend_from_slice(bytemuck::bytes_of(&header));
    file.extend_from_slice(&((ints.len() * 4) as u32).to_le_bytes());
    file.extend_from_slice(bytemuck::cast_slice(&ints));

    std::fs::write(tree_path, file)?;
    std::fs::write(brick_path, &bricks)?;

    log::info!(
        "saved svo tree: {} K ints, {} KB of bricks",
        ints.len() / 1024,
        bricks.len() / 1024
    );
    Ok(())
}

fn emit_node(
    tree: &SvoTree,
    id: NodeId,
    format: TextureFormat,
    ints: &mut Vec<i32>,
    bricks: &mut Vec<u8>,
) {
    let node = tree.node(id);

    let mut mask = 0i32;
    for child_id in 0..8 {
        if node.child(child_id).is_some() {
            mask |= 1 << child_id;
        }
    }
    ints.push(mask);

    match node.segment.map(|s| tree.segment(s)) {
        Some(segment) => {
            ints.push(1);
            ints.push(segment.id as i32);
            if segment.channels.is_some() {
                let record = build_brick_record(segment, format);
                let offset = bricks.len() as i64;
                ints.push(offset as i32);
                ints.push((offset >> 32) as i32);
                ints.push(record.len() as i32);
                bricks.extend_from_slice(&record);
            } else {
                // not resident: rebuilt by voxelization on demand
                ints.push(-1);
                ints.push(-1);
                ints.push(-1);
            }
        }
        None => ints.push(0),
    }

    for child_id in 0..8 {
        if let Some(child) = node.child(child_id) {
            emit_node(tree, child, format, ints, bricks);
        }
    }
}

/// Load a tree file into `tree`, replacing any conflicting topology.
///
/// Subtrees outside `area_filter` are restored as topology stubs: the node
/// exists but no segment is allocated and its children are not
/// materialized (their serialized records are still consumed).
pub fn load(
    tree: &mut SvoTree,
    tree_path: &Path,
    area_filter: Option<&Aabb>,
) -> Result<(TextureFormat, usize)> {
    let bytes = std::fs::read(tree_path)?;
    if bytes.len() < 12 {
        return Err(Error::Corrupt("tree file shorter than header".into()));
    }

    let header: TreeFileHeader = bytemuck::pod_read_unaligned(&bytes[..8]);
    let format = TextureFormat::from_tag(header.format_tag)?;

    let payload = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if payload % 4 != 0 || bytes.len() < 12 + payload {
        return Err(Error::Corrupt("tree file truncated".into()));
    }

    let ints: Vec<i32> = bytes[12..12 + payload]
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut cursor = 0usize;
    let mut created = 0usize;
    load_node(tree, tree.root(), &ints, &mut cursor, area_filter, &mut created)?;

    if cursor != ints.len() {
        return Err(Error::Corrupt(format!(
            "tree data has {} trailing ints",
            ints.len() - cursor
        )));
    }

    log::info!("loaded svo tree: {} nodes", created);
    Ok((format, created))
}

fn next(ints: &[i32], cursor: &mut usize) -> Result<i32> {
    let value = ints
        .get(*cursor)
        .copied()
        .ok_or_else(|| Error::Corrupt("truncated tree data".into()))?;
    *cursor += 1;
    Ok(value)
}

fn load_node(
    tree: &mut SvoTree,
    id: NodeId,
    ints: &[i32],
    cursor: &mut usize,
    area_filter: Option<&Aabb>,
    created: &mut usize,
) -> Result<()> {
    let mask = next(ints, cursor)?;

    for child_id in 0..8 {
        if mask & (1 << child_id) != 0 {
            if tree.node(id).child(child_id).is_none() {
                tree.create_child(id, child_id);
            }
            *created += 1;
        } else if tree.node(id).child(child_id).is_some() {
            tree.detach_and_free_child(id, child_id);
        }
    }

    let clouds = next(ints, cursor)?;
    if clouds != 0 {
        let seg_id = next(ints, cursor)?;
        let lo = next(ints, cursor)?;
        let hi = next(ints, cursor)?;
        let length = next(ints, cursor)?;

        if tree.node(id).segment.is_none() {
            tree.allocate_segment(id, IVec3::ZERO);
        }
        let handle = tree.node(id).segment.expect("just allocated");
        let segment = tree.segment_mut(handle);
        segment.id = seg_id as u32;
        segment.file_offset = ((hi as i64) << 32) | (lo as u32 as i64);
        segment.file_length = length;
        tree.note_persisted_segment_id(seg_id as u32);
    } else {
        tree.remove_segment(id);
    }

    let outside = area_filter
        .map(|filter| !filter.intersects(&tree.node(id).bounds))
        .unwrap_or(false);

    for child_id in 0..8 {
        if mask & (1 << child_id) == 0 {
            continue;
        }
        if outside {
            skip_node(ints, cursor)?;
        } else {
            let child = tree.node(id).child(child_id).expect("created above");
            load_node(tree, child, ints, cursor, area_filter, created)?;
        }
    }

    Ok(())
}

/// Consume one serialized node record without materializing anything.
fn skip_node(ints: &[i32], cursor: &mut usize) -> Result<()> {
    let mask = next(ints, cursor)?;
    let clouds = next(ints, cursor)?;
    if clouds != 0 {
        *cursor += 4;
        if *cursor > ints.len() {
            return Err(Error::Corrupt("truncated tree data".into()));
        }
    }
    for child_id in 0..8 {
        if mask & (1 << child_id) != 0 {
            skip_node(ints, cursor)?;
        }
    }
    Ok(())
}
