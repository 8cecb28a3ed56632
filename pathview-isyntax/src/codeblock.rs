//! Codeblock bookkeeping: the per-level tile grids, block-id derivation
//! for the seektable, and the grouping of codeblocks into data chunks.

use log::error;

use crate::image::{Image, Level, TileGrid, TileState};

/// Wavelet padding added around each level during encoding. The shift
/// compounds per level; see [`first_valid_coef_pixel`].
pub(crate) const PER_LEVEL_PADDING: i32 = 3;

/// The smallest independently-encoded unit: one color channel, one scale,
/// one subband (LL or the H triplet) of a block-sized region.
#[derive(Debug, Clone, Default)]
pub(crate) struct Codeblock {
    pub(crate) x_coordinate: u32,
    pub(crate) y_coordinate: u32,
    pub(crate) color_component: u32,
    pub(crate) scale: u32,
    /// 0 = LL, 1 = H (LH+HL+HH triplet).
    pub(crate) coefficient: u32,
    pub(crate) block_data_offset: u64,
    pub(crate) block_size: u64,
    pub(crate) block_header_template_id: u32,
    /// Grid-aligned tile coordinates, derived from the raw coordinates.
    pub(crate) block_x: i32,
    pub(crate) block_y: i32,
    /// Index into the seektable (v1 files only).
    pub(crate) block_id: u64,
}

/// A contiguous file range holding the codeblock cluster of one tile
/// position: the top-scale codeblock plus 4 at scale-1 plus 16 at
/// scale-2, per color, with the extra LL block at the pyramid top.
#[derive(Debug, Clone, Default)]
pub(crate) struct DataChunk {
    pub(crate) offset: u64,
    pub(crate) size: u32,
    pub(crate) top_codeblock_index: u32,
    pub(crate) codeblock_count_per_color: u32,
    pub(crate) scale: i32,
}

/// First pixel at `scale` that carries valid detail coefficients; the
/// per-level padding compounds as `(3 << scale) - 2`.
#[inline]
pub(crate) fn first_valid_coef_pixel(scale: i32) -> i32 {
    (PER_LEVEL_PADDING << scale) - (PER_LEVEL_PADDING - 1)
}

/// First pixel at `scale` that carries valid LL coefficients.
#[inline]
pub(crate) fn first_valid_ll_pixel(scale: i32) -> i32 {
    first_valid_coef_pixel(scale) + (1 << scale)
}

/// Number of codeblocks per color channel inside the chunk whose top
/// scale is `scale`: 1 for the top level, plus 4 and 16 for up to two
/// levels below, plus one LL codeblock at the overall pyramid top.
pub(crate) fn chunk_codeblocks_per_color_for_scale(scale: i32, has_ll: bool) -> u32 {
    let count = match scale.rem_euclid(3) {
        0 => 1,
        1 => 1 + 4,
        _ => 1 + 4 + 16,
    };
    if has_ll { count + 1 } else { count }
}

/// Index of a tile's H codeblock within its chunk, given how many scales
/// the tile sits below the chunk's top scale.
pub(crate) fn codeblock_index_in_chunk(scale_in_chunk: i32, tile_x: i32, tile_y: i32) -> u32 {
    match scale_in_chunk {
        0 => 0,
        1 => (1 + (tile_y.rem_euclid(2)) * 2 + tile_x.rem_euclid(2)) as u32,
        2 => (5 + (tile_y.rem_euclid(4)) * 4 + tile_x.rem_euclid(4)) as u32,
        _ => unreachable!("chunks span at most three scales"),
    }
}

/// The contiguous byte range a chunk occupies on disk: the recorded
/// cluster size when the header supplied one (v2), otherwise the span
/// from the first through the last codeblock.
pub(crate) fn chunk_byte_range(image: &Image, chunk: &DataChunk) -> (u64, usize) {
    if chunk.size > 0 {
        return (chunk.offset, chunk.size as usize);
    }
    let per_color = chunk.codeblock_count_per_color as usize;
    let top = &image.codeblocks[chunk.top_codeblock_index as usize];
    let last = &image.codeblocks[chunk.top_codeblock_index as usize + per_color * 3 - 1];
    let base = top.block_data_offset;
    (base, (last.block_data_offset + last.block_size - base) as usize)
}

/// Derive the pyramid levels of a whole-slide image: grid-aligned tile
/// counts, level dimensions, micrometer geometry, and the per-level
/// origin shift caused by the wavelet padding.
pub(crate) fn derive_levels(
    image: &mut Image,
    mpp_x: f32,
    mpp_y: f32,
    block_width: i32,
    block_height: i32,
) {
    let num_levels = image.level_count;
    debug_assert!(num_levels >= 1);
    let tile_width = block_width * 2;
    let tile_height = block_height * 2;

    // The tile grid is aligned so that every level down to the base has a
    // whole number of tiles.
    let grid_width = ((image.width_including_padding + (block_width << num_levels) - 1)
        / (block_width << num_levels))
        << (num_levels - 1);
    let grid_height = ((image.height_including_padding + (block_height << num_levels) - 1)
        / (block_height << num_levels))
        << (num_levels - 1);

    let base_level_tile_count = (grid_width as usize) * (grid_height as usize);
    let mut tile_offset = 0usize;
    image.levels = (0..num_levels)
        .map(|scale| {
            let downsample_factor = (1i64 << scale) as f32;
            let um_per_pixel_x = mpp_x * downsample_factor;
            let um_per_pixel_y = mpp_y * downsample_factor;
            let level = Level {
                scale,
                width_in_tiles: grid_width >> scale,
                height_in_tiles: grid_height >> scale,
                width: image.width >> scale,
                height: image.height >> scale,
                downsample_factor,
                um_per_pixel_x,
                um_per_pixel_y,
                x_tile_side_in_um: tile_width as f32 * um_per_pixel_x,
                y_tile_side_in_um: tile_height as f32 * um_per_pixel_y,
                tile_count: base_level_tile_count >> (scale * 2),
                tile_offset,
                origin_offset_in_pixels: if scale > 0 {
                    first_valid_coef_pixel(scale - 1)
                } else {
                    0
                },
                origin_offset_um: (0.0, 0.0),
            };
            tile_offset += level.tile_count;
            level
        })
        .collect();

    // The origin shift is expressed in level-0 micrometers.
    let base_um_x = image.levels[0].um_per_pixel_x;
    let base_um_y = image.levels[0].um_per_pixel_y;
    for level in image.levels.iter_mut().skip(1) {
        level.origin_offset_um = (
            level.origin_offset_in_pixels as f32 * base_um_x,
            level.origin_offset_in_pixels as f32 * base_um_y,
        );
    }
}

/// Derive grid-aligned coordinates and the seektable block id for every
/// codeblock.
///
/// The block id counts tiles level by level from scale 0 upward (LL
/// codeblocks sort one level higher than their scale), then row-major
/// within the level grid, with the whole table repeated per color.
pub(crate) fn assign_block_grid_coords(image: &mut Image, tile_width: i32, tile_height: i32) {
    let levels = image.levels.clone();
    let num_levels = image.level_count;
    let grid_width = levels[0].width_in_tiles;

    // Tiles with H coefficients exist on every level; the top level
    // additionally has LL tiles.
    let h_coeff_tile_count: u64 = levels.iter().map(|l| l.tile_count as u64).sum();
    let ll_coeff_tile_count = levels[(num_levels - 1) as usize].tile_count as u64;
    let total_coeff_tile_count = h_coeff_tile_count + ll_coeff_tile_count;

    for codeblock in &mut image.codeblocks {
        let x_adjusted = codeblock.x_coordinate as i32 - image.offset_x;
        let y_adjusted = codeblock.y_coordinate as i32 - image.offset_y;

        let is_ll = codeblock.coefficient == 0;
        let max_scale_for_id = if is_ll {
            codeblock.scale + 1
        } else {
            codeblock.scale
        };
        let mut block_id: u64 = levels
            .iter()
            .take(max_scale_for_id as usize)
            .map(|l| l.tile_count as u64)
            .sum();

        let offset = if is_ll {
            first_valid_ll_pixel(codeblock.scale as i32)
        } else {
            first_valid_coef_pixel(codeblock.scale as i32)
        };
        let x = x_adjusted - offset;
        let y = y_adjusted - offset;
        codeblock.block_x = x / (tile_width << codeblock.scale);
        codeblock.block_y = y / (tile_height << codeblock.scale);

        let grid_stride = (grid_width >> codeblock.scale) as u64;
        block_id += codeblock.block_y as u64 * grid_stride + codeblock.block_x as u64;
        block_id += codeblock.color_component as u64 * total_coeff_tile_count;
        codeblock.block_id = block_id;
    }
}

/// Walk the codeblock table grouping codeblocks into chunks, and link
/// every tile to its codeblock, its chunk's top codeblock, and its data
/// chunk. Returns `false` when more chunks are encountered than the
/// layout allows.
///
/// For v2 files the data chunks were already populated from the cluster
/// header table; pass `create_chunks = false` to keep them.
pub(crate) fn build_tile_tables(image: &mut Image, grid: &mut TileGrid, create_chunks: bool) -> bool {
    grid.tiles = Vec::new();
    grid.level_fully_loaded = vec![false; image.level_count as usize];
    for level in &image.levels {
        for i in 0..level.tile_count {
            let i = i as i32;
            grid.tiles.push(TileState {
                scale: level.scale,
                tile_x: i % level.width_in_tiles,
                tile_y: i / level.width_in_tiles,
                ..TileState::default()
            });
        }
    }

    let max_chunk_count = if create_chunks {
        // Chunks only start at every third scale (and at the pyramid top).
        let mut count = 0usize;
        for level in &image.levels {
            if (level.scale + 1) % 3 == 0 || level.scale == image.max_scale {
                count += level.tile_count;
            }
        }
        image.data_chunks = Vec::with_capacity(count);
        count
    } else {
        image.data_chunks.len()
    };

    let mut current_chunk_codeblock_index = 0usize;
    let mut next_chunk_codeblock_index = 0usize;
    let mut current_data_chunk_index = 0usize;
    let mut next_data_chunk_index = 0usize;

    let mut i = 0usize;
    while i < image.codeblocks.len() {
        if image.codeblocks[i].color_component != 0 {
            // Color channels 1 and 2 must not overwrite what their chunk's
            // first channel already recorded; skip ahead to the next chunk.
            i = next_chunk_codeblock_index;
            if i >= image.codeblocks.len() {
                break;
            }
        }

        if i == next_chunk_codeblock_index {
            // This codeblock is the top of a new chunk.
            let codeblock = &image.codeblocks[i];
            let per_color = if codeblock.scale as i32 == image.max_scale {
                chunk_codeblocks_per_color_for_scale(codeblock.scale as i32, true)
            } else {
                chunk_codeblocks_per_color_for_scale(2, false)
            };
            current_chunk_codeblock_index = i;
            next_chunk_codeblock_index = i + (per_color as usize) * 3;
            current_data_chunk_index = next_data_chunk_index;
            if current_data_chunk_index >= max_chunk_count {
                error!("encountered too many data chunks");
                return false;
            }
            if create_chunks {
                image.data_chunks.push(DataChunk {
                    offset: codeblock.block_data_offset,
                    size: 0,
                    top_codeblock_index: current_chunk_codeblock_index as u32,
                    codeblock_count_per_color: per_color,
                    scale: codeblock.scale as i32,
                });
            }
            next_data_chunk_index += 1;
        }

        let codeblock = &image.codeblocks[i];
        let level = &image.levels[codeblock.scale as usize];
        let tile_index =
            level.tile_offset + (codeblock.block_y * level.width_in_tiles + codeblock.block_x) as usize;
        debug_assert!(tile_index < level.tile_offset + level.tile_count);
        let tile = grid.tile_mut(tile_index);
        tile.exists = true;
        tile.codeblock_index = i as u32;
        tile.codeblock_chunk_index = current_chunk_codeblock_index as u32;
        tile.data_chunk_index = current_data_chunk_index as u32;

        i += 1;
    }

    true
}
