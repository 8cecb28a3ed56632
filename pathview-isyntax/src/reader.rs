//! On-demand tile reconstruction.
//!
//! Producing the pixels of one tile requires a whole dependency cone:
//! the tile's own subbands, the margins of its 8 neighbors, and LL
//! coefficients that only exist after the parent tile's inverse
//! transform, recursively up to the pyramid top. A request therefore
//! builds three disjoint lists:
//!
//! 1. the *idwt list* — the target plus every ancestor whose transform
//!    must run so the next level down receives its LL blocks,
//! 2. the *coeff list* — neighbors at each level that only need their
//!    coefficients resident to provide valid margins,
//! 3. the *children list* — tiles one level below an idwt tile, which
//!    receive donated LL blocks as a side effect.
//!
//! All three are reserved (taken out of the cache LRU) for the duration
//! of the request and re-inserted at the head afterwards, ancestors
//! first.

use log::error;

use crate::Isyntax;
use crate::cache::{Allocators, Cache, LruList};
use crate::codeblock::codeblock_index_in_chunk;
use crate::color::{PixelFormat, convert_ycocg_block};
use crate::coeff::twos_complement_to_absolute_value_block;
use crate::error::{Error, Result, bail};
use crate::hulsken::hulsken_decompress;
use crate::image::{Image, TileGrid};
use crate::idwt::idwt_tile;
use crate::stitch::{
    IDWT_FIRST_VALID_PIXEL, IDWT_PAD_L, IDWT_PAD_R, extract_ll_window, stitch_quadrants,
};

struct TileLists {
    idwt: Vec<usize>,
    coeff: Vec<usize>,
    children: Vec<usize>,
}

/// The four children of a tile, one level down.
fn child_indices(image: &Image, grid: &TileGrid, tile_index: usize) -> [usize; 4] {
    let tile = grid.tile(tile_index);
    debug_assert!(tile.scale > 0);
    let next_level = &image.levels[(tile.scale - 1) as usize];
    let top_left = TileGrid::tile_index(next_level, tile.tile_x * 2, tile.tile_y * 2);
    [
        top_left,
        top_left + 1,
        top_left + next_level.width_in_tiles as usize,
        top_left + next_level.width_in_tiles as usize + 1,
    ]
}

fn add_parent_to_idwt_list(
    image: &Image,
    grid: &mut TileGrid,
    lru: &mut LruList,
    slide: u32,
    tile_index: usize,
    idwt_list: &mut Vec<usize>,
) {
    let tile = grid.tile(tile_index);
    let parent_scale = tile.scale + 1;
    if parent_scale > image.max_scale() {
        return;
    }
    let parent_level = &image.levels[parent_scale as usize];
    let parent_index = TileGrid::tile_index(parent_level, tile.tile_x / 2, tile.tile_y / 2);
    let parent = grid.tile_mut(parent_index);
    if parent.exists && !parent.cache_marked {
        parent.cache_marked = true;
        lru.remove((slide, parent_index as u32));
        idwt_list.push(parent_index);
    }
}

/// Build the three reconstruction lists bottom-up, reserving every
/// participant. The idwt list ends up ordered target-first; execution
/// walks it in reverse so ancestors run before descendants.
fn make_tile_lists(
    image: &Image,
    grid: &mut TileGrid,
    lru: &mut LruList,
    slide: u32,
    target_index: usize,
    start_scale: i32,
) -> TileLists {
    let mut lists = TileLists {
        idwt: vec![target_index],
        coeff: Vec::new(),
        children: Vec::new(),
    };
    grid.tile_mut(target_index).cache_marked = true;
    lru.remove((slide, target_index as u32));

    for scale in start_scale..=image.max_scale() {
        let level = &image.levels[scale as usize];

        // Every idwt tile at this scale needs its 8 neighbors'
        // coefficients for valid margins.
        let mut i = 0;
        while i < lists.idwt.len() {
            let tile_index = lists.idwt[i];
            i += 1;
            let (tile_scale, tile_x, tile_y) = {
                let t = grid.tile(tile_index);
                (t.scale, t.tile_x, t.tile_y)
            };
            if tile_scale != scale {
                continue;
            }
            for y_offset in -1..=1 {
                for x_offset in -1..=1 {
                    let neighbor_x = tile_x + x_offset;
                    let neighbor_y = tile_y + y_offset;
                    if neighbor_x < 0
                        || neighbor_x >= level.width_in_tiles
                        || neighbor_y < 0
                        || neighbor_y >= level.height_in_tiles
                    {
                        continue;
                    }
                    let neighbor_index = TileGrid::tile_index(level, neighbor_x, neighbor_y);
                    let neighbor = grid.tile_mut(neighbor_index);
                    if neighbor.cache_marked || !neighbor.exists {
                        continue;
                    }
                    neighbor.cache_marked = true;
                    lru.remove((slide, neighbor_index as u32));
                    lists.coeff.push(neighbor_index);
                }
            }
        }

        // Parents of everything at this scale join the idwt list so the
        // tiles here receive their LL coefficients.
        let mut i = 0;
        while i < lists.idwt.len() {
            let tile_index = lists.idwt[i];
            i += 1;
            if grid.tile(tile_index).scale == scale {
                add_parent_to_idwt_list(image, grid, lru, slide, tile_index, &mut lists.idwt);
            }
        }
        let mut i = 0;
        while i < lists.coeff.len() {
            let tile_index = lists.coeff[i];
            i += 1;
            if grid.tile(tile_index).scale == scale {
                add_parent_to_idwt_list(image, grid, lru, slide, tile_index, &mut lists.idwt);
            }
        }
    }

    // Children of idwt tiles receive LL blocks during the transform and
    // get a cache bump of their own.
    for i in 0..lists.idwt.len() {
        let tile_index = lists.idwt[i];
        if grid.tile(tile_index).scale > 0 {
            for child_index in child_indices(image, grid, tile_index) {
                if !grid.tile(child_index).cache_marked {
                    lru.remove((slide, child_index as u32));
                    lists.children.push(child_index);
                }
            }
        }
    }

    // The marks have served their double-inclusion purpose.
    for &tile_index in lists.idwt.iter().chain(&lists.coeff) {
        grid.tile_mut(tile_index).cache_marked = false;
    }

    lists
}

/// Make one tile's coefficients resident. Loads happen at chunk
/// granularity: one file read covers the whole codeblock cluster.
fn load_tile_coefficients(
    isyntax: &Isyntax,
    image: &Image,
    grid: &mut TileGrid,
    allocators: &Allocators,
    tile_index: usize,
) -> Result<()> {
    let (exists, has_ll, has_h, scale, tile_x, tile_y, chunk_index, codeblock_index, chunk_codeblock_index) = {
        let t = grid.tile(tile_index);
        (
            t.exists,
            t.has_ll,
            t.has_h,
            t.scale,
            t.tile_x,
            t.tile_y,
            t.data_chunk_index as usize,
            t.codeblock_index as usize,
            t.codeblock_chunk_index as usize,
        )
    };
    if !exists {
        return Ok(());
    }
    let needs_ll = !has_ll && scale == image.max_scale();
    if has_h && !needs_ll {
        return Ok(());
    }

    let chunk = &image.data_chunks[chunk_index];
    let per_color = chunk.codeblock_count_per_color as usize;

    // One contiguous read spanning the whole codeblock cluster.
    let (chunk_base, chunk_len) = crate::codeblock::chunk_byte_range(image, chunk);
    let mut scratch = vec![0u8; chunk_len];
    isyntax
        .file
        .read_at(&mut scratch, chunk_base)
        .map_err(|e| Error::Open(e.into()))?;

    let block_width = isyntax.block_width as usize;
    let block_height = isyntax.block_height as usize;
    let compressor = image.compressor_version.unwrap_or(crate::image::CompressorVersion::V1);

    let decompress_into = |codeblock_index: usize, out: &mut [i16]| {
        let codeblock = &image.codeblocks[codeblock_index];
        let Some(start) = codeblock
            .block_data_offset
            .checked_sub(chunk_base)
            .map(|v| v as usize)
        else {
            error!("codeblock sits before its chunk; leaving the block empty");
            return;
        };
        let Some(data) = scratch.get(start..start + codeblock.block_size as usize) else {
            error!("codeblock data range escapes its chunk; leaving the block empty");
            return;
        };
        if let Err(e) = hulsken_decompress(
            data,
            block_width,
            block_height,
            codeblock.coefficient,
            compressor,
            out,
        ) {
            // The output is zero-filled; the tile renders as background.
            error!(
                "codeblock decode failed at scale {} ({}, {}): {e}",
                scale, tile_x, tile_y
            );
        }
    };

    // LL codeblocks exist only at the pyramid top; lower scales receive
    // LL by propagation from the parent's inverse transform.
    if needs_ll {
        for color in 0..3 {
            let mut block = allocators.ll.alloc();
            decompress_into(codeblock_index + color * per_color, block.as_mut_slice());
            grid.tile_mut(tile_index).channels[color].coeff_ll = Some(block);
        }
        grid.tile_mut(tile_index).has_ll = true;
    }

    if !has_h {
        let scale_in_chunk = chunk.scale - scale;
        debug_assert!((0..3).contains(&scale_in_chunk));
        let index_in_chunk = codeblock_index_in_chunk(scale_in_chunk, tile_x, tile_y) as usize;
        for color in 0..3 {
            let mut block = allocators.h.alloc();
            decompress_into(
                chunk_codeblock_index + index_in_chunk + color * per_color,
                block.as_mut_slice(),
            );
            grid.tile_mut(tile_index).channels[color].coeff_h = Some(block);
        }
        grid.tile_mut(tile_index).has_h = true;
    }

    Ok(())
}

/// Run the inverse transform for one tile: stitch and transform each
/// color channel, donate the four LL sub-windows to the children one
/// level down, and (for the requested tile only) produce pixels.
pub(crate) fn transform_tile(
    isyntax: &Isyntax,
    image: &Image,
    grid: &mut TileGrid,
    allocators: &Allocators,
    tile_index: usize,
    mut output: Option<(&mut [u8], PixelFormat)>,
) {
    let (scale, tile_x, tile_y) = {
        let t = grid.tile(tile_index);
        (t.scale, t.tile_x, t.tile_y)
    };
    let level = &image.levels[scale as usize];
    let block_width = isyntax.block_width as usize;
    let block_height = isyntax.block_height as usize;
    let quadrant_width = block_width + IDWT_PAD_L + IDWT_PAD_R;
    let quadrant_height = block_height + IDWT_PAD_L + IDWT_PAD_R;
    let idwt_width = 2 * quadrant_width;
    let idwt_height = 2 * quadrant_height;
    let idwt_stride = idwt_width;

    let mut planes: [Vec<i16>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    let mut invalid_edges = 0u32;

    for color in 0..3 {
        let mut idwt = vec![0i16; idwt_width * idwt_height];
        invalid_edges |= stitch_quadrants(
            grid,
            level,
            tile_x,
            tile_y,
            color,
            block_width,
            block_height,
            &isyntax.black_dummy,
            &isyntax.white_dummy,
            &mut idwt,
        );
        idwt_tile(&mut idwt, quadrant_width, quadrant_height);

        if scale > 0 {
            // Donate the four LL sub-windows to the children. Any LL
            // block a child already holds is returned first.
            let children = child_indices(image, grid, tile_index);
            for (child_number, &child_index) in children.iter().enumerate() {
                let child = grid.tile_mut(child_index);
                if let Some(old) = child.channels[color].coeff_ll.take() {
                    allocators.ll.free(old);
                }
                let mut block = allocators.ll.alloc();
                let x0 = IDWT_FIRST_VALID_PIXEL + (child_number % 2) * block_width;
                let y0 = IDWT_FIRST_VALID_PIXEL + (child_number / 2) * block_height;
                extract_ll_window(
                    &idwt,
                    idwt_stride,
                    x0,
                    y0,
                    block_width,
                    block_height,
                    block.as_mut_slice(),
                );
                child.channels[color].coeff_ll = Some(block);
            }
            if color == 2 {
                for child_index in children {
                    grid.tile_mut(child_index).has_ll = true;
                }
                if invalid_edges != 0 {
                    error!(
                        "transform at scale {} ({}, {}) used invalid edges {:#x}",
                        scale, tile_x, tile_y, invalid_edges
                    );
                    return;
                }
            }
        }

        planes[color] = idwt;
    }

    grid.tile_mut(tile_index).is_loaded = true;

    let Some((out_pixels, format)) = output.take() else {
        return;
    };

    // The color transform consumes the absolute value of the luminance
    // coefficients; Co and Cg are used as signed values directly.
    twos_complement_to_absolute_value_block(&mut planes[0]);

    let valid_offset = IDWT_FIRST_VALID_PIXEL * idwt_stride + IDWT_FIRST_VALID_PIXEL;
    convert_ycocg_block(
        &planes[0][valid_offset..],
        &planes[1][valid_offset..],
        &planes[2][valid_offset..],
        block_width * 2,
        block_height * 2,
        idwt_stride,
        format,
        out_pixels,
    );
}

/// Whether the tile still needs its own inverse transform, which is only
/// the case when some child lacks LL coefficients.
fn children_need_ll(image: &Image, grid: &TileGrid, tile_index: usize) -> bool {
    child_indices(image, grid, tile_index)
        .iter()
        .any(|&child| !grid.tile(child).has_ll)
}

/// Read one tile into `out_pixels` (`tile_width * tile_height * 4`
/// bytes). Tiles outside the grid or absent from the file produce solid
/// white.
pub(crate) fn read_tile(
    isyntax: &Isyntax,
    cache: &Cache,
    scale: i32,
    tile_x: i64,
    tile_y: i64,
    out_pixels: &mut [u8],
    format: PixelFormat,
) -> Result<()> {
    let image = isyntax.wsi_image().ok_or(Error::InvalidArgument("no WSI image"))?;
    if scale < 0 || scale >= image.level_count {
        bail!(Error::InvalidArgument("scale out of range"));
    }
    let level = &image.levels[scale as usize];
    if tile_x < 0
        || tile_x >= level.width_in_tiles as i64
        || tile_y < 0
        || tile_y >= level.height_in_tiles as i64
    {
        out_pixels.fill(0xFF);
        return Ok(());
    }
    let (tile_x, tile_y) = (tile_x as i32, tile_y as i32);

    let slide = *isyntax
        .slide_id
        .get()
        .ok_or(Error::InvalidArgument("isyntax is not injected into a cache"))?;

    // The entire reconstruction is serialized on the cache mutex; the
    // per-tile decode work dominates, and a finer scheme would have to
    // handle two threads loading the same tile.
    let mut inner = cache.inner.lock();
    let inner = &mut *inner;
    let allocators = inner
        .allocators
        .clone()
        .ok_or(Error::InvalidArgument("cache has no allocators"))?;
    let grid_arc = inner
        .grids
        .get(&slide)
        .cloned()
        .ok_or(Error::InvalidArgument("isyntax is not injected into this cache"))?;
    let mut grid = grid_arc.lock();

    let target_index = TileGrid::tile_index(level, tile_x, tile_y);
    if !grid.tile(target_index).exists {
        out_pixels.fill(0xFF);
        return Ok(());
    }

    let lists = make_tile_lists(image, &mut grid, &mut inner.lru, slide, target_index, scale);

    // Coefficients first (roots or not, loads are independent), then the
    // transforms ancestors-first so LL donations arrive before use.
    for &tile_index in lists.coeff.iter().chain(&lists.idwt) {
        load_tile_coefficients(isyntax, image, &mut grid, &allocators, tile_index)?;
    }
    for &tile_index in lists.idwt.iter().rev() {
        if tile_index == target_index {
            transform_tile(
                isyntax,
                image,
                &mut grid,
                &allocators,
                tile_index,
                Some((out_pixels, format)),
            );
        } else if grid.tile(tile_index).scale > 0
            && children_need_ll(image, &grid, tile_index)
        {
            transform_tile(isyntax, image, &mut grid, &allocators, tile_index, None);
        }
    }

    // Release the reservations: everything returns to the LRU head,
    // ancestors most recent, then the margin tiles, then the children.
    for &tile_index in lists.children.iter() {
        if !inner.lru.contains((slide, tile_index as u32)) {
            inner.lru.insert_first((slide, tile_index as u32));
        }
    }
    for &tile_index in lists.coeff.iter().chain(&lists.idwt) {
        inner.lru.insert_first((slide, tile_index as u32));
    }

    drop(grid);
    inner.trim_to_target();
    Ok(())
}
