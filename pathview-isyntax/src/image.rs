//! The in-memory data model for a parsed iSyntax file: images, pyramid
//! levels, and per-tile state.

use crate::block_alloc::CoeffBlock;
use crate::codeblock::{Codeblock, DataChunk};

/// The role of an image inside an iSyntax file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageType {
    #[default]
    None,
    /// Overview photo of the whole slide.
    Macro,
    /// Photo of the slide label.
    Label,
    /// The tiled whole-slide image itself.
    Wsi,
}

/// Which flavor of the Hulsken compressor produced the codeblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorVersion {
    V1,
    V2,
}

/// One level of the whole-slide pyramid.
#[derive(Debug, Clone, Default)]
pub struct Level {
    pub(crate) scale: i32,
    pub(crate) width_in_tiles: i32,
    pub(crate) height_in_tiles: i32,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) downsample_factor: f32,
    pub(crate) um_per_pixel_x: f32,
    pub(crate) um_per_pixel_y: f32,
    pub(crate) x_tile_side_in_um: f32,
    pub(crate) y_tile_side_in_um: f32,
    pub(crate) tile_count: usize,
    /// Index of this level's first tile in the image-wide tile array.
    pub(crate) tile_offset: usize,
    /// The per-level padding shift of the level origin, in level-0 pixels.
    pub(crate) origin_offset_in_pixels: i32,
    /// The same shift expressed in micrometers.
    pub(crate) origin_offset_um: (f32, f32),
}

impl Level {
    pub fn scale(&self) -> i32 {
        self.scale
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn width_in_tiles(&self) -> i32 {
        self.width_in_tiles
    }

    pub fn height_in_tiles(&self) -> i32 {
        self.height_in_tiles
    }

    pub fn downsample_factor(&self) -> f32 {
        self.downsample_factor
    }

    pub fn um_per_pixel_x(&self) -> f32 {
        self.um_per_pixel_x
    }

    pub fn um_per_pixel_y(&self) -> f32 {
        self.um_per_pixel_y
    }

    pub fn tile_side_in_um(&self) -> (f32, f32) {
        (self.x_tile_side_in_um, self.y_tile_side_in_um)
    }

    pub fn origin_offset_um(&self) -> (f32, f32) {
        self.origin_offset_um
    }
}

/// A byte span inside the file, recorded during header parsing for
/// payloads that are only fetched on demand.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FileSpan {
    pub(crate) offset: u64,
    pub(crate) len: usize,
}

/// One image descriptor (WSI, label, or macro).
#[derive(Debug, Default)]
pub struct Image {
    pub(crate) image_type: ImageType,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) width_including_padding: i32,
    pub(crate) height_including_padding: i32,
    pub(crate) offset_x: i32,
    pub(crate) offset_y: i32,
    pub(crate) level_count: i32,
    pub(crate) max_scale: i32,
    pub(crate) levels: Vec<Level>,
    pub(crate) compressor_version: Option<CompressorVersion>,
    pub(crate) compression_is_lossy: bool,
    pub(crate) lossy_image_compression_ratio: f32,
    /// Codeblock count declared by the header; the number actually present
    /// in the file may be lower.
    pub(crate) number_of_blocks: i32,
    pub(crate) codeblocks: Vec<Codeblock>,
    pub(crate) data_chunks: Vec<DataChunk>,
    pub(crate) header_codeblocks_are_partial: bool,
    /// Base64 span of the associated JPEG (label/macro images only).
    pub(crate) base64_jpeg: Option<FileSpan>,
    /// Base64 span of the embedded ICC profile.
    pub(crate) base64_icc_profile: Option<FileSpan>,
}

impl Image {
    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn level_count(&self) -> i32 {
        self.level_count
    }

    pub fn level(&self, index: i32) -> Option<&Level> {
        usize::try_from(index).ok().and_then(|i| self.levels.get(i))
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Which compressor produced the codeblocks (WSI images only).
    pub fn compressor_version(&self) -> Option<CompressorVersion> {
        self.compressor_version
    }

    pub fn compression_is_lossy(&self) -> bool {
        self.compression_is_lossy
    }

    pub fn lossy_compression_ratio(&self) -> f32 {
        self.lossy_image_compression_ratio
    }

    pub(crate) fn max_scale(&self) -> i32 {
        self.max_scale
    }
}

/// Per-color-channel coefficient residency of one tile.
#[derive(Default)]
pub(crate) struct TileChannel {
    /// Approximation subband. Present on top-scale tiles after their LL
    /// codeblock is decoded, on lower-scale tiles after the parent's
    /// inverse transform donated it.
    pub(crate) coeff_ll: Option<CoeffBlock>,
    /// The three detail subbands, stored back to back.
    pub(crate) coeff_h: Option<CoeffBlock>,
}

/// Mutable per-tile state. Lives in the [`TileGrid`], which is guarded by
/// the cache mutex (or the instance mutex when no cache is injected).
#[derive(Default)]
pub(crate) struct TileState {
    pub(crate) exists: bool,
    /// Index of this tile's first codeblock in `Image::codeblocks`.
    pub(crate) codeblock_index: u32,
    /// Index of the first codeblock of the chunk this tile belongs to.
    pub(crate) codeblock_chunk_index: u32,
    pub(crate) data_chunk_index: u32,
    pub(crate) channels: [TileChannel; 3],
    pub(crate) has_ll: bool,
    pub(crate) has_h: bool,
    pub(crate) is_loaded: bool,
    pub(crate) is_submitted_for_loading: bool,
    pub(crate) is_submitted_for_h_decompress: bool,
    /// Guard against double-inclusion while the reconstruction lists are
    /// being built.
    pub(crate) cache_marked: bool,
    pub(crate) scale: i32,
    pub(crate) tile_x: i32,
    pub(crate) tile_y: i32,
}

/// The mutable tile state of one whole-slide image, flat over all levels
/// (see `Level::tile_offset`).
#[derive(Default)]
pub(crate) struct TileGrid {
    pub(crate) tiles: Vec<TileState>,
    pub(crate) level_fully_loaded: Vec<bool>,
    pub(crate) first_load_complete: bool,
}

impl TileGrid {
    #[inline]
    pub(crate) fn tile(&self, index: usize) -> &TileState {
        &self.tiles[index]
    }

    #[inline]
    pub(crate) fn tile_mut(&mut self, index: usize) -> &mut TileState {
        &mut self.tiles[index]
    }

    /// Global index of the tile at `(tile_x, tile_y)` within `level`.
    #[inline]
    pub(crate) fn tile_index(level: &Level, tile_x: i32, tile_y: i32) -> usize {
        level.tile_offset + (tile_y * level.width_in_tiles + tile_x) as usize
    }
}
