//! Stitching the padded 4-quadrant input of the inverse wavelet
//! transform.
//!
//! The transform of one tile needs margins from all 8 neighbors so that
//! its edge pixels come out identical to the neighbors' interior pixels.
//! The stitched buffer is `2 * (block + 8)` on each side, laid out as the
//! four subband quadrants LL|HL over LH|HH; every quadrant is filled from
//! nine sources (the tile itself plus its neighbors), with shared dummy
//! blocks standing in for anything that is missing: zeros for detail
//! subbands, white for the luminance LL (slide background is white).

use crate::image::{Level, TileGrid};

pub(crate) const IDWT_PAD_L: usize = 4;
pub(crate) const IDWT_PAD_R: usize = 4;
/// First row/column of the transformed buffer carrying valid pixels.
pub(crate) const IDWT_FIRST_VALID_PIXEL: usize = 7;

// 9 bits for the 3x3 neighborhood:
//   0x100 | 0x80 | 0x40
//   0x20  | 0x10 | 0x08
//   0x04  | 0x02 | 0x01
pub(crate) const ADJ_TOP_LEFT: u32 = 0x100;
pub(crate) const ADJ_TOP_CENTER: u32 = 0x80;
pub(crate) const ADJ_TOP_RIGHT: u32 = 0x40;
pub(crate) const ADJ_CENTER_LEFT: u32 = 0x20;
pub(crate) const ADJ_CENTER: u32 = 0x10;
pub(crate) const ADJ_CENTER_RIGHT: u32 = 0x08;
pub(crate) const ADJ_BOTTOM_LEFT: u32 = 0x04;
pub(crate) const ADJ_BOTTOM_CENTER: u32 = 0x02;
pub(crate) const ADJ_BOTTOM_RIGHT: u32 = 0x01;

/// Mask of the neighborhood positions that fall inside the level grid.
pub(crate) fn adjacent_tiles_mask(level: &Level, tile_x: i32, tile_y: i32) -> u32 {
    debug_assert!(tile_x >= 0 && tile_y >= 0);
    let mut adj = 0x1FF;
    if tile_y == 0 {
        adj &= !(ADJ_TOP_LEFT | ADJ_TOP_CENTER | ADJ_TOP_RIGHT);
    }
    if tile_y == level.height_in_tiles - 1 {
        adj &= !(ADJ_BOTTOM_LEFT | ADJ_BOTTOM_CENTER | ADJ_BOTTOM_RIGHT);
    }
    if tile_x == 0 {
        adj &= !(ADJ_TOP_LEFT | ADJ_CENTER_LEFT | ADJ_BOTTOM_LEFT);
    }
    if tile_x == level.width_in_tiles - 1 {
        adj &= !(ADJ_TOP_RIGHT | ADJ_CENTER_RIGHT | ADJ_BOTTOM_RIGHT);
    }
    adj
}

/// Like [`adjacent_tiles_mask`], further restricted to neighbors that
/// actually exist in the file.
pub(crate) fn adjacent_tiles_mask_only_existing(
    grid: &TileGrid,
    level: &Level,
    tile_x: i32,
    tile_y: i32,
) -> u32 {
    let adjacent = adjacent_tiles_mask(level, tile_x, tile_y);
    let mut mask = 0;
    for &(bit, dx, dy) in NEIGHBORHOOD {
        if adjacent & bit != 0 {
            let index = TileGrid::tile_index(level, tile_x + dx, tile_y + dy);
            if grid.tile(index).exists {
                mask |= bit;
            }
        }
    }
    mask
}

/// The nine positions with their grid offsets, in mask order.
pub(crate) const NEIGHBORHOOD: &[(u32, i32, i32)] = &[
    (ADJ_TOP_LEFT, -1, -1),
    (ADJ_TOP_CENTER, 0, -1),
    (ADJ_TOP_RIGHT, 1, -1),
    (ADJ_CENTER_LEFT, -1, 0),
    (ADJ_CENTER, 0, 0),
    (ADJ_CENTER_RIGHT, 1, 0),
    (ADJ_BOTTOM_LEFT, -1, 1),
    (ADJ_BOTTOM_CENTER, 0, 1),
    (ADJ_BOTTOM_RIGHT, 1, 1),
];

/// Stitch the padded 4-quadrant input for one color channel of one tile
/// into `dest` (zeroed by the caller, `4 * (block_w + 8) * (block_h + 8)`
/// coefficients). Returns the mask of neighbors that exist but had no
/// resident coefficients, i.e. the edges that were filled from dummies
/// and are not valid yet.
pub(crate) fn stitch_quadrants(
    grid: &TileGrid,
    level: &Level,
    tile_x: i32,
    tile_y: i32,
    color: usize,
    block_width: usize,
    block_height: usize,
    black_dummy: &[i16],
    white_dummy: &[i16],
    dest: &mut [i16],
) -> u32 {
    let pad_l = IDWT_PAD_L;
    let pad_r = IDWT_PAD_R;
    let quadrant_width = block_width + pad_l + pad_r;
    let quadrant_height = block_height + pad_l + pad_r;
    let dest_stride = 2 * quadrant_width;
    debug_assert_eq!(dest.len(), dest_stride * 2 * quadrant_height);

    let adj_tiles = adjacent_tiles_mask(level, tile_x, tile_y);

    // Missing luminance LL renders as white (slide background), so the
    // whole LL quadrant is seeded with white before stitching.
    if color == 0 {
        for y in 0..quadrant_height {
            dest[y * dest_stride..y * dest_stride + quadrant_width].fill(255);
        }
    }
    let ll_dummy = if color == 0 { white_dummy } else { black_dummy };

    let source_stride = block_width;
    let block_stride = block_width * block_height;
    let left_margin_source_x = block_width - pad_r;
    let top_margin_source_y = block_height - pad_r;

    let quadrant_offsets = [
        0,
        quadrant_width,
        dest_stride * quadrant_height,
        dest_stride * quadrant_height + quadrant_width,
    ];

    let mut invalid_neighbors_ll = 0u32;
    let mut invalid_neighbors_h = 0u32;

    for &(bit, dx, dy) in NEIGHBORHOOD {
        if adj_tiles & bit == 0 {
            continue;
        }
        let source_index = TileGrid::tile_index(level, tile_x + dx, tile_y + dy);
        let source_tile = grid.tile(source_index);
        if !source_tile.exists {
            continue;
        }
        let channel = &source_tile.channels[color];
        if bit != ADJ_CENTER {
            if channel.coeff_ll.is_none() {
                invalid_neighbors_ll |= bit;
            }
            if channel.coeff_h.is_none() {
                invalid_neighbors_h |= bit;
            }
        }

        // Which part of the source block feeds this position, and where
        // it lands in each destination quadrant.
        let (source_offset, dest_x, dest_y, copy_w, copy_h) = match (dx, dy) {
            (-1, -1) => (
                top_margin_source_y * source_stride + left_margin_source_x,
                0,
                0,
                pad_l,
                pad_l,
            ),
            (0, -1) => (
                top_margin_source_y * source_stride,
                pad_l,
                0,
                block_width,
                pad_l,
            ),
            (1, -1) => (
                top_margin_source_y * source_stride,
                pad_l + block_width,
                0,
                pad_r,
                pad_l,
            ),
            (-1, 0) => (left_margin_source_x, 0, pad_l, pad_l, block_height),
            (0, 0) => (0, pad_l, pad_l, block_width, block_height),
            (1, 0) => (0, pad_l + block_width, pad_l, pad_r, block_height),
            (-1, 1) => (
                left_margin_source_x,
                0,
                pad_l + block_height,
                pad_l,
                pad_r,
            ),
            (0, 1) => (0, pad_l, pad_l + block_height, block_width, pad_r),
            (1, 1) => (
                0,
                pad_l + block_width,
                pad_l + block_height,
                pad_r,
                pad_r,
            ),
            _ => unreachable!(),
        };

        // The four subband sources: LL from the LL block (or the white /
        // black dummy), HL/LH/HH from thirds of the H block (or the
        // zero dummy). Dummies are read from their origin.
        let ll_hl_lh_hh: [(&[i16], usize); 4] = match (&channel.coeff_ll, &channel.coeff_h) {
            (Some(ll), Some(h)) => [
                (ll.as_slice(), source_offset),
                (h.as_slice(), source_offset),
                (h.as_slice(), block_stride + source_offset),
                (h.as_slice(), 2 * block_stride + source_offset),
            ],
            (Some(ll), None) => [
                (ll.as_slice(), source_offset),
                (black_dummy, source_offset),
                (black_dummy, source_offset),
                (black_dummy, source_offset),
            ],
            (None, Some(h)) => [
                (ll_dummy, source_offset),
                (h.as_slice(), source_offset),
                (h.as_slice(), block_stride + source_offset),
                (h.as_slice(), 2 * block_stride + source_offset),
            ],
            (None, None) => [
                (ll_dummy, source_offset),
                (black_dummy, source_offset),
                (black_dummy, source_offset),
                (black_dummy, source_offset),
            ],
        };

        for (&quadrant, &(source, offset)) in quadrant_offsets.iter().zip(ll_hl_lh_hh.iter()) {
            let mut src = offset;
            let mut dst = quadrant + dest_y * dest_stride + dest_x;
            for _ in 0..copy_h {
                dest[dst..dst + copy_w].copy_from_slice(&source[src..src + copy_w]);
                src += source_stride;
                dst += dest_stride;
            }
        }
    }

    invalid_neighbors_ll | invalid_neighbors_h
}

/// Copy one `block_width x block_height` window out of a transformed
/// tile buffer, starting at `(x0, y0)`. The four child LL donations are
/// exactly these windows at `FIRST_VALID_PIXEL` offset by zero or one
/// block side in each direction.
pub(crate) fn extract_ll_window(
    transformed: &[i16],
    stride: usize,
    x0: usize,
    y0: usize,
    block_width: usize,
    block_height: usize,
    out: &mut [i16],
) {
    debug_assert_eq!(out.len(), block_width * block_height);
    for row in 0..block_height {
        let src = (y0 + row) * stride + x0;
        out[row * block_width..(row + 1) * block_width]
            .copy_from_slice(&transformed[src..src + block_width]);
    }
}
