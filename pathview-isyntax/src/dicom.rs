//! The binary DICOM sub-streams embedded in the XML header.
//!
//! Three tables arrive base64-encoded inside `Attribute` leaves and are
//! decoded here once the XML layer has collected them: the v1 block
//! header table (partial 48-byte or full 80-byte records), the v2 cluster
//! header table, and — read straight from the file after the header
//! terminator — the v1 seektable that supplies the data offsets the
//! partial records lack.

use log::warn;
use smallvec::SmallVec;

use crate::byte_reader::Reader;
use crate::codeblock::{Codeblock, DataChunk, chunk_codeblocks_per_color_for_scale};
use crate::error::{OpenError, bail};

/// A raw DICOM tag header: `(group, element, value length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TagHeader {
    pub(crate) group: u16,
    pub(crate) element: u16,
    pub(crate) size: u32,
}

/// Size of one seektable record: three tag headers plus two u64 values.
pub(crate) const SEEKTABLE_ENTRY_SIZE: usize = 40;

impl TagHeader {
    pub(crate) fn read(reader: &mut Reader<'_>) -> Option<Self> {
        let group = reader.read_u16()?;
        let element = reader.read_u16()?;
        let size = reader.read_u32()?;
        Some(Self {
            group,
            element,
            size,
        })
    }
}

/// A block header template referenced by codeblocks via template id.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BlockHeaderTemplate {
    pub(crate) block_width: u32,
    pub(crate) block_height: u32,
    /// 0 = Y, 1 = Co, 2 = Cg.
    pub(crate) color_component: u8,
    pub(crate) scale: u8,
    /// 1 for LL, 3 for the LH+HL+HH triplet.
    pub(crate) waveletcoeff: u8,
}

/// Relative coordinates of one codeblock within a cluster template. The
/// raw coordinates are reordered by the template's dimension order and
/// added to the base values once the template is complete.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClusterRelativeCoords {
    pub(crate) raw_coords: [u32; 5],
    pub(crate) block_header_template_id: u32,
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) color_component: u32,
    pub(crate) scale: u32,
    pub(crate) waveletcoeff: u32,
}

pub(crate) const MAX_CODEBLOCKS_PER_CLUSTER: usize = 70;

/// Describes how to unpack one cluster layout: base dimension values plus
/// per-codeblock relative offsets.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClusterHeaderTemplate {
    pub(crate) base_x: u32,
    pub(crate) base_y: u32,
    pub(crate) base_scale: u8,
    pub(crate) base_waveletcoeff: u8,
    pub(crate) base_color_component: u8,
    pub(crate) relative_coords: Vec<ClusterRelativeCoords>,
    pub(crate) dimension_order: SmallVec<[i32; 5]>,
}

/// Parse the v1 block header table. Returns the codeblocks and whether
/// the records were partial (data offsets to be resolved from the
/// seektable).
pub(crate) fn parse_block_header_table(
    decoded: &[u8],
) -> Result<(Vec<Codeblock>, bool), OpenError> {
    let mut reader = Reader::new(decoded);
    let header_size = reader
        .read_u32()
        .ok_or(OpenError::BlockTableInconsistent)? as usize;
    let sequence_element =
        TagHeader::read(&mut reader.clone()).ok_or(OpenError::BlockTableInconsistent)?;

    let (record_size, partial) = match sequence_element.size {
        // 'Block Data Offset' and 'Block Size' missing, stored in the
        // seektable; the full record is 48 bytes including the sequence
        // element.
        40 => (48usize, true),
        // Complete records, nothing in the seektable.
        72 => (80usize, false),
        _ => bail!(OpenError::BlockTableInconsistent),
    };
    if !header_size.is_multiple_of(record_size) {
        bail!(OpenError::BlockTableInconsistent);
    }
    let block_count = header_size / record_size;

    let mut codeblocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let _sequence = TagHeader::read(&mut reader).ok_or(OpenError::BlockTableInconsistent)?;
        let _coords = TagHeader::read(&mut reader).ok_or(OpenError::BlockTableInconsistent)?;
        let mut codeblock = Codeblock {
            x_coordinate: reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?,
            y_coordinate: reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?,
            color_component: reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?,
            scale: reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?,
            coefficient: reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?,
            ..Codeblock::default()
        };
        if !partial {
            let _offset_header =
                TagHeader::read(&mut reader).ok_or(OpenError::BlockTableInconsistent)?;
            codeblock.block_data_offset =
                reader.read_u64().ok_or(OpenError::BlockTableInconsistent)?;
            let _size_header =
                TagHeader::read(&mut reader).ok_or(OpenError::BlockTableInconsistent)?;
            codeblock.block_size = reader.read_u64().ok_or(OpenError::BlockTableInconsistent)?;
        }
        let _template_header =
            TagHeader::read(&mut reader).ok_or(OpenError::BlockTableInconsistent)?;
        codeblock.block_header_template_id =
            reader.read_u32().ok_or(OpenError::BlockTableInconsistent)?;
        codeblocks.push(codeblock);
    }

    Ok((codeblocks, partial))
}

/// Resolve the missing data offsets of partial block headers from the
/// seektable bytes that follow the header terminator in v1 files.
pub(crate) fn apply_seektable(
    seektable: &[u8],
    codeblocks: &mut [Codeblock],
) -> Result<(), OpenError> {
    let entry_count = seektable.len() / SEEKTABLE_ENTRY_SIZE;
    for codeblock in codeblocks.iter_mut() {
        let index = codeblock.block_id as usize;
        if index >= entry_count {
            bail!(OpenError::SeektableInvalid);
        }
        let mut reader = Reader::new(seektable);
        reader.jump(index * SEEKTABLE_ENTRY_SIZE);
        let _start = TagHeader::read(&mut reader).ok_or(OpenError::SeektableInvalid)?;
        let offset_header = TagHeader::read(&mut reader).ok_or(OpenError::SeektableInvalid)?;
        if offset_header.group != 0x301D || offset_header.element != 0x2010 {
            bail!(OpenError::SeektableInvalid);
        }
        codeblock.block_data_offset = reader.read_u64().ok_or(OpenError::SeektableInvalid)?;
        let _size_header = TagHeader::read(&mut reader).ok_or(OpenError::SeektableInvalid)?;
        codeblock.block_size = reader.read_u64().ok_or(OpenError::SeektableInvalid)?;
    }
    Ok(())
}

/// Parse the v2 cluster header table: two passes, first counting the
/// clusters, then resolving each cluster template's relative offsets into
/// absolute codeblock coordinates and attaching the data ranges.
pub(crate) fn parse_cluster_header_table(
    decoded: &[u8],
    templates: &[ClusterHeaderTemplate],
    declared_codeblock_count: usize,
) -> Result<(Vec<Codeblock>, Vec<DataChunk>), OpenError> {
    let mut reader = Reader::new(decoded);
    let _header_size = reader
        .read_u32()
        .ok_or(OpenError::ClusterTableInconsistent)?;
    let records_start = reader.offset();

    // Pass 1: count clusters.
    let mut cluster_count = 0usize;
    {
        let mut r = reader.clone();
        while !r.at_end() {
            let Some(sequence) = TagHeader::read(&mut r) else {
                break;
            };
            if sequence.group != 0xFFFE || sequence.element != 0xE000 {
                break;
            }
            if r.skip_bytes(sequence.size as usize).is_none() {
                break;
            }
            cluster_count += 1;
        }
        if cluster_count == 0 {
            bail!(OpenError::ClusterTableInconsistent);
        }
    }

    let mut codeblocks: Vec<Codeblock> = Vec::with_capacity(declared_codeblock_count);
    let mut data_chunks: Vec<DataChunk> = Vec::with_capacity(cluster_count);

    // Pass 2: fill in all the information for each cluster.
    reader.jump(records_start);
    for _ in 0..cluster_count {
        let sequence = TagHeader::read(&mut reader).ok_or(OpenError::ClusterTableInconsistent)?;
        let record = reader
            .read_bytes(sequence.size as usize)
            .ok_or(OpenError::ClusterTableInconsistent)?;
        let mut r = Reader::new(record);

        // Cluster coordinates. Only X and Y are required; scale,
        // coefficient and color component derive from the template.
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        let coordinate_count = (element.size / 4) as usize;
        if coordinate_count < 2 {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let cluster_x = r.read_u32().ok_or(OpenError::ClusterTableInconsistent)?;
        let cluster_y = r.read_u32().ok_or(OpenError::ClusterTableInconsistent)?;
        let third_coordinate = if coordinate_count >= 3 {
            Some(r.read_u32().ok_or(OpenError::ClusterTableInconsistent)?)
        } else {
            None
        };
        r.skip_bytes(coordinate_count.saturating_sub(3) * 4)
            .ok_or(OpenError::ClusterTableInconsistent)?;

        // Cluster header template id.
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        if element.size != 4 {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let template_id = r.read_u32().ok_or(OpenError::ClusterTableInconsistent)? as usize;
        let template = templates
            .get(template_id)
            .ok_or(OpenError::ClusterTableInconsistent)?;
        if let Some(third) = third_coordinate {
            // Observed in sample files: the third coordinate repeats the
            // template's base scale. Anything else means we misread the
            // table.
            if third != template.base_scale as u32 {
                bail!(OpenError::ClusterTableInconsistent);
            }
        }

        // Cluster data offset and total size.
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        if element.size != 8 {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let cluster_data_offset = r.read_u64().ok_or(OpenError::ClusterTableInconsistent)?;
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        if element.size != 8 {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let cluster_size = r.read_u64().ok_or(OpenError::ClusterTableInconsistent)?;

        // Per-codeblock data offsets and byte sizes.
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        let block_count = (element.size / 4) as usize;
        let offsets_bytes = r
            .read_bytes(block_count * 4)
            .ok_or(OpenError::ClusterTableInconsistent)?;
        let element = TagHeader::read(&mut r).ok_or(OpenError::ClusterTableInconsistent)?;
        if (element.size / 4) as usize != block_count {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let sizes_bytes = r
            .read_bytes(block_count * 4)
            .ok_or(OpenError::ClusterTableInconsistent)?;

        if block_count > template.relative_coords.len() {
            bail!(OpenError::ClusterTableInconsistent);
        }

        let top_codeblock_index = codeblocks.len() as u32;
        let mut has_ll = false;
        let mut highest_scale = 0u32;
        for j in 0..block_count {
            let relative = &template.relative_coords[j];
            let data_offset = u32::from_le_bytes(offsets_bytes[j * 4..j * 4 + 4].try_into().unwrap());
            let size = u32::from_le_bytes(sizes_bytes[j * 4..j * 4 + 4].try_into().unwrap());

            // The v2 wavelet coefficient encoding differs: 3 marks the LL
            // block.
            let coefficient = if relative.waveletcoeff == 3 { 0 } else { 1 };
            if coefficient == 0 {
                has_ll = true;
            }
            highest_scale = highest_scale.max(relative.scale);

            codeblocks.push(Codeblock {
                x_coordinate: cluster_x + relative.x,
                y_coordinate: cluster_y + relative.y,
                color_component: relative.color_component,
                scale: relative.scale,
                coefficient,
                block_data_offset: cluster_data_offset + data_offset as u64,
                block_size: size as u64,
                block_header_template_id: relative.block_header_template_id,
                ..Codeblock::default()
            });
        }

        let first_offset =
            u32::from_le_bytes(offsets_bytes[0..4].try_into().unwrap()) as u64;
        let last_index = block_count - 1;
        let last_end = u32::from_le_bytes(
            offsets_bytes[last_index * 4..last_index * 4 + 4].try_into().unwrap(),
        ) as u64
            + u32::from_le_bytes(sizes_bytes[last_index * 4..last_index * 4 + 4].try_into().unwrap())
                as u64;
        if last_end > cluster_size {
            bail!(OpenError::ClusterTableInconsistent);
        }
        let per_color = (block_count / 3) as u32;
        if per_color != chunk_codeblocks_per_color_for_scale(highest_scale as i32, has_ll) {
            warn!(
                "cluster codeblock count {} does not match its {}-level layout",
                block_count, highest_scale
            );
        }
        data_chunks.push(DataChunk {
            offset: cluster_data_offset + first_offset,
            size: (last_end - first_offset) as u32,
            top_codeblock_index,
            codeblock_count_per_color: per_color,
            scale: highest_scale as i32,
        });
    }

    if codeblocks.len() > declared_codeblock_count {
        warn!(
            "cluster table yielded {} codeblocks, header declared {}",
            codeblocks.len(),
            declared_codeblock_count
        );
    }

    Ok((codeblocks, data_chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(group: u16, element: u16, size: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&group.to_le_bytes());
        out.extend_from_slice(&element.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    fn full_block_record(x: u32, y: u32, color: u32, scale: u32, coeff: u32, offset: u64, size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tag(0xFFFE, 0xE000, 72));
        out.extend_from_slice(&tag(0x301D, 0x200E, 20));
        for v in [x, y, color, scale, coeff] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&tag(0x301D, 0x2010, 8));
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&tag(0x301D, 0x2011, 8));
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&tag(0x301D, 0x2012, 4));
        out.extend_from_slice(&7u32.to_le_bytes());
        out
    }

    #[test]
    fn full_block_header_records() {
        let mut table = Vec::new();
        table.extend_from_slice(&160u32.to_le_bytes());
        table.extend_from_slice(&full_block_record(10, 20, 0, 8, 1, 1000, 64));
        table.extend_from_slice(&full_block_record(10, 20, 1, 8, 1, 1064, 32));

        let (codeblocks, partial) = parse_block_header_table(&table).unwrap();
        assert!(!partial);
        assert_eq!(codeblocks.len(), 2);
        assert_eq!(codeblocks[0].x_coordinate, 10);
        assert_eq!(codeblocks[0].block_data_offset, 1000);
        assert_eq!(codeblocks[1].color_component, 1);
        assert_eq!(codeblocks[1].block_size, 32);
        assert_eq!(codeblocks[1].block_header_template_id, 7);
    }

    #[test]
    fn partial_block_header_records_and_seektable() {
        let mut record = Vec::new();
        record.extend_from_slice(&tag(0xFFFE, 0xE000, 40));
        record.extend_from_slice(&tag(0x301D, 0x200E, 20));
        for v in [5u32, 6, 0, 2, 1] {
            record.extend_from_slice(&v.to_le_bytes());
        }
        record.extend_from_slice(&tag(0x301D, 0x2012, 4));
        record.extend_from_slice(&3u32.to_le_bytes());
        assert_eq!(record.len(), 48);

        let mut table = Vec::new();
        table.extend_from_slice(&48u32.to_le_bytes());
        table.extend_from_slice(&record);

        let (mut codeblocks, partial) = parse_block_header_table(&table).unwrap();
        assert!(partial);
        assert_eq!(codeblocks.len(), 1);
        assert_eq!(codeblocks[0].block_data_offset, 0);

        // Seektable with two entries; the codeblock's block id picks the
        // second one.
        codeblocks[0].block_id = 1;
        let mut seektable = Vec::new();
        for (offset, size) in [(111u64, 11u64), (222, 22)] {
            seektable.extend_from_slice(&tag(0xFFFE, 0xE000, 32));
            seektable.extend_from_slice(&tag(0x301D, 0x2010, 8));
            seektable.extend_from_slice(&offset.to_le_bytes());
            seektable.extend_from_slice(&tag(0x301D, 0x2011, 8));
            seektable.extend_from_slice(&size.to_le_bytes());
        }
        apply_seektable(&seektable, &mut codeblocks).unwrap();
        assert_eq!(codeblocks[0].block_data_offset, 222);
        assert_eq!(codeblocks[0].block_size, 22);
    }

    #[test]
    fn truncated_table_is_rejected() {
        let mut table = Vec::new();
        table.extend_from_slice(&80u32.to_le_bytes());
        table.extend_from_slice(&tag(0xFFFE, 0xE000, 72));
        assert!(parse_block_header_table(&table).is_err());
    }

    fn one_cluster_template() -> ClusterHeaderTemplate {
        let mut template = ClusterHeaderTemplate {
            base_x: 5,
            base_y: 7,
            base_scale: 0,
            ..ClusterHeaderTemplate::default()
        };
        for color in 0..3u32 {
            template.relative_coords.push(ClusterRelativeCoords {
                block_header_template_id: 9,
                x: 5,
                y: 7,
                color_component: color,
                scale: 0,
                waveletcoeff: 0, // v2: anything but 3 marks an H block
                ..ClusterRelativeCoords::default()
            });
        }
        template
    }

    fn one_cluster_table(third_coordinate: Option<u32>) -> Vec<u8> {
        // One cluster at (100, 200) with three codeblocks (one per
        // color), data at 4096 with offsets 0/64/96.
        let mut record = Vec::new();
        let coords: Vec<u32> = match third_coordinate {
            Some(third) => vec![100, 200, third],
            None => vec![100, 200],
        };
        record.extend_from_slice(&tag(0x301D, 0x200E, coords.len() as u32 * 4));
        for c in &coords {
            record.extend_from_slice(&c.to_le_bytes());
        }
        record.extend_from_slice(&tag(0x301D, 0x2012, 4));
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&tag(0x301D, 0x2019, 8));
        record.extend_from_slice(&4096u64.to_le_bytes());
        record.extend_from_slice(&tag(0x301D, 0x201A, 8));
        record.extend_from_slice(&128u64.to_le_bytes());
        record.extend_from_slice(&tag(0x301D, 0x201B, 12));
        for offset in [0u32, 64, 96] {
            record.extend_from_slice(&offset.to_le_bytes());
        }
        record.extend_from_slice(&tag(0x301D, 0x201C, 12));
        for size in [64u32, 32, 32] {
            record.extend_from_slice(&size.to_le_bytes());
        }

        let mut table = Vec::new();
        table.extend_from_slice(&(record.len() as u32 + 8).to_le_bytes());
        table.extend_from_slice(&tag(0xFFFE, 0xE000, record.len() as u32));
        table.extend_from_slice(&record);
        table
    }

    #[test]
    fn cluster_table_resolves_template_coordinates() {
        let templates = [one_cluster_template()];
        let (codeblocks, chunks) =
            parse_cluster_header_table(&one_cluster_table(Some(0)), &templates, 3).unwrap();

        assert_eq!(codeblocks.len(), 3);
        for (color, codeblock) in codeblocks.iter().enumerate() {
            assert_eq!(codeblock.x_coordinate, 105);
            assert_eq!(codeblock.y_coordinate, 207);
            assert_eq!(codeblock.color_component, color as u32);
            assert_eq!(codeblock.coefficient, 1);
            assert_eq!(codeblock.block_header_template_id, 9);
        }
        assert_eq!(codeblocks[0].block_data_offset, 4096);
        assert_eq!(codeblocks[1].block_data_offset, 4096 + 64);
        assert_eq!(codeblocks[2].block_size, 32);

        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.offset, 4096);
        assert_eq!(chunk.size, 128);
        assert_eq!(chunk.codeblock_count_per_color, 1);
        assert_eq!(chunk.scale, 0);
    }

    #[test]
    fn cluster_third_coordinate_must_match_the_template_scale() {
        let templates = [one_cluster_template()];
        assert!(parse_cluster_header_table(&one_cluster_table(Some(3)), &templates, 3).is_err());
        // Two coordinates are fine; the scale derives from the template.
        assert!(parse_cluster_header_table(&one_cluster_table(None), &templates, 3).is_ok());
    }
}
