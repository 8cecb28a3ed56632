//! A memory-safe, pure-Rust decoder for Philips iSyntax whole-slide
//! images.
//!
//! iSyntax stores a slide as a pyramid of wavelet-coefficient codeblocks
//! rather than pre-rendered tiles: serving a tile means parsing the
//! XML-over-DICOM header, reading compressed codeblock clusters,
//! entropy-decoding each codeblock, running an integer 5/3 inverse
//! wavelet transform that depends on neighboring tiles and the parent
//! level, and converting from YCoCg to RGB. This crate implements that
//! whole path:
//!
//! ```no_run
//! use pathview_isyntax::{Cache, Isyntax, OpenOptions, PixelFormat};
//!
//! let isyntax = Isyntax::open("slide.isyntax", OpenOptions::for_cache())?;
//! let cache = Cache::new(Some("viewer"), 2000);
//! cache.inject(&isyntax)?;
//!
//! let (tw, th) = (isyntax.tile_width(), isyntax.tile_height());
//! let mut pixels = vec![0u8; (tw * th * 4) as usize];
//! isyntax.read_tile(&cache, 0, 0, 0, &mut pixels, PixelFormat::Rgba)?;
//! # Ok::<(), pathview_isyntax::Error>(())
//! ```

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, OnceLock};

use log::warn;
use parking_lot::Mutex;

mod associated;
mod bit_reader;
mod block_alloc;
mod byte_reader;
mod cache;
mod codeblock;
mod coeff;
mod color;
mod dicom;
mod error;
mod file;
mod header;
mod hulsken;
mod idwt;
mod image;
mod math;
mod reader;
mod stitch;
mod streamer;
mod work_queue;
mod xml;

pub use cache::Cache;
pub use color::PixelFormat;
pub use error::{DecodeError, Error, OpenError, Result};
pub use image::{CompressorVersion, Image, ImageType, Level};
pub use streamer::{CameraBounds, Streamer};
pub use work_queue::{CompletionQueue, TileCompletion, WorkQueue, WorkerPool};

use byte_reader::Reader;
use error::bail;
use cache::Allocators;
use codeblock::PER_LEVEL_PADDING;
use dicom::{SEEKTABLE_ENTRY_SIZE, TagHeader};
use file::FileHandle;
use image::TileGrid;

/// How an [`Isyntax`] acquires its coefficient allocators.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Create the instance's own allocator pair at open. When `false`,
    /// the allocators arrive later through [`Cache::inject`].
    pub init_allocators: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            init_allocators: true,
        }
    }
}

impl OpenOptions {
    /// Options for an instance that will be injected into a [`Cache`].
    pub fn for_cache() -> Self {
        Self {
            init_allocators: false,
        }
    }
}

/// An open iSyntax file.
pub struct Isyntax {
    pub(crate) file: FileHandle,
    images: Vec<Image>,
    wsi_image_index: Option<usize>,
    label_image_index: Option<usize>,
    macro_image_index: Option<usize>,
    mpp_x: f32,
    mpp_y: f32,
    is_mpp_known: bool,
    pub(crate) block_width: i32,
    pub(crate) block_height: i32,
    pub(crate) tile_width: i32,
    pub(crate) tile_height: i32,
    data_model_major_version: i32,
    barcode: Option<String>,
    /// Shared read-only stand-ins for missing subbands: zeros for detail
    /// coefficients, white for luminance LL.
    pub(crate) black_dummy: Vec<i16>,
    pub(crate) white_dummy: Vec<i16>,
    /// Mutable per-tile state; also registered with the cache at
    /// injection so trimming can reach it.
    pub(crate) grid: Arc<Mutex<TileGrid>>,
    /// Set once: either owned (opened with `init_allocators`) or shared
    /// with a cache.
    pub(crate) allocators: OnceLock<Arc<Allocators>>,
    pub(crate) slide_id: OnceLock<u32>,
}

impl Isyntax {
    /// Open an iSyntax file and parse its header, block tables and
    /// codeblock index.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let file = FileHandle::open(path.as_ref()).map_err(OpenError::Io)?;
        let filesize = file.size();

        let (parsed, data_offset) = header::parse_file_header(&file)?;

        let mut mpp_x = parsed.mpp_x;
        let mut mpp_y = parsed.mpp_y;
        let mut is_mpp_known = parsed.is_mpp_known;
        if mpp_x <= 0.0 || mpp_y <= 0.0 {
            // Should usually be around 0.25; zero or below can never be
            // right.
            mpp_x = 1.0;
            mpp_y = 1.0;
            is_mpp_known = false;
        }

        let first_template = parsed
            .block_header_templates
            .first()
            .ok_or(OpenError::XmlMalformed("no block header templates"))?;
        let block_width = first_template.block_width as i32;
        let block_height = first_template.block_height as i32;
        if block_width <= 0 || block_height <= 0 || block_width % 8 != 0 || block_height % 8 != 0 {
            bail!(OpenError::XmlMalformed("unusable block dimensions"));
        }
        // Tile dimensions after the inverse wavelet transform.
        let tile_width = block_width * 2;
        let tile_height = block_height * 2;

        let mut images = parsed.images;
        let wsi_image_index = parsed.wsi_image_index.ok_or(OpenError::NoWsiImage)?;
        let grid = Arc::new(Mutex::new(TileGrid::default()));

        {
            let image = &mut images[wsi_image_index];
            if image.level_count < 1 {
                bail!(OpenError::XmlMalformed("WSI has no levels"));
            }
            codeblock::derive_levels(image, mpp_x, mpp_y, block_width, block_height);
            codeblock::assign_block_grid_coords(image, tile_width, tile_height);

            let mut grid = grid.lock();
            if image.header_codeblocks_are_partial {
                // The block header table lacked the data ranges; they
                // live in the seektable right after the header
                // terminator.
                let mut tag_bytes = [0u8; 8];
                file.read_at(&mut tag_bytes, data_offset)
                    .map_err(OpenError::Io)?;
                let tag = TagHeader::read(&mut Reader::new(&tag_bytes))
                    .ok_or(OpenError::SeektableInvalid)?;
                if tag.group != 0x301D || tag.element != 0x2015 {
                    bail!(OpenError::SeektableInvalid);
                }
                let seektable_size = if (tag.size as i32) < 0 {
                    // Declared size is a "don't know"; guess from the
                    // codeblock count.
                    warn!("seektable size is unknown, guessing from the codeblock count");
                    image.codeblocks.len() * SEEKTABLE_ENTRY_SIZE
                } else {
                    tag.size as usize
                };
                if (seektable_size as u64) > filesize.saturating_sub(data_offset + 8) {
                    bail!(OpenError::SeektableInvalid);
                }
                let mut seektable = vec![0u8; seektable_size];
                file.read_at(&mut seektable, data_offset + 8)
                    .map_err(OpenError::Io)?;
                dicom::apply_seektable(&seektable, &mut image.codeblocks)?;
                if !codeblock::build_tile_tables(image, &mut grid, true) {
                    bail!(OpenError::BlockTableInconsistent);
                }
            } else if parsed.data_model_major_version >= 100 {
                // v2: the cluster header table was self-contained.
                if !codeblock::build_tile_tables(image, &mut grid, false) {
                    bail!(OpenError::ClusterTableInconsistent);
                }
            } else {
                // v1 with inline data ranges; no seektable to resolve.
                if !codeblock::build_tile_tables(image, &mut grid, true) {
                    bail!(OpenError::BlockTableInconsistent);
                }
            }

            for codeblock in &image.codeblocks {
                if codeblock.block_data_offset.saturating_add(codeblock.block_size) > filesize {
                    bail!(OpenError::CodeblockOutOfBounds);
                }
            }
        }

        let block_area = (block_width * block_height) as usize;
        let allocators = OnceLock::new();
        if options.init_allocators {
            let _ = allocators.set(Arc::new(Allocators::new(block_width, block_height)));
        }

        Ok(Self {
            file,
            images,
            wsi_image_index: Some(wsi_image_index),
            label_image_index: parsed.label_image_index,
            macro_image_index: parsed.macro_image_index,
            mpp_x,
            mpp_y,
            is_mpp_known,
            block_width,
            block_height,
            tile_width,
            tile_height,
            data_model_major_version: parsed.data_model_major_version,
            barcode: parsed.barcode,
            black_dummy: vec![0i16; block_area],
            white_dummy: vec![255i16; block_area],
            grid,
            allocators,
            slide_id: OnceLock::new(),
        })
    }

    /// Tile width in pixels (twice the block width).
    pub fn tile_width(&self) -> i32 {
        self.tile_width
    }

    /// Tile height in pixels (twice the block height).
    pub fn tile_height(&self) -> i32 {
        self.tile_height
    }

    /// Micrometers per pixel at the base level.
    pub fn mpp(&self) -> (f32, f32) {
        (self.mpp_x, self.mpp_y)
    }

    /// Whether the file declared its micrometers-per-pixel scale (when
    /// not, [`Isyntax::mpp`] reports 1.0).
    pub fn is_mpp_known(&self) -> bool {
        self.is_mpp_known
    }

    /// The data model major version: below 100 for iSyntax v1, 100 and
    /// above for v2.
    pub fn data_model_major_version(&self) -> i32 {
        self.data_model_major_version
    }

    /// The slide barcode, when present.
    pub fn barcode(&self) -> Option<&str> {
        self.barcode.as_deref()
    }

    /// All images in the file (WSI plus associated images).
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// The whole-slide image descriptor.
    pub fn wsi_image(&self) -> Option<&Image> {
        self.wsi_image_index.and_then(|i| self.images.get(i))
    }

    /// The label image descriptor, when present.
    pub fn label_image(&self) -> Option<&Image> {
        self.label_image_index.and_then(|i| self.images.get(i))
    }

    /// The macro (slide overview) image descriptor, when present.
    pub fn macro_image(&self) -> Option<&Image> {
        self.macro_image_index.and_then(|i| self.images.get(i))
    }

    /// Read one tile of the WSI into `pixels`
    /// (`tile_width * tile_height * 4` bytes). Tiles outside the level
    /// grid, or positions with no data in the file, come back solid
    /// white. The instance must have been injected into `cache`.
    pub fn read_tile(
        &self,
        cache: &Cache,
        level: i32,
        tile_x: i64,
        tile_y: i64,
        pixels: &mut [u8],
        pixel_format: PixelFormat,
    ) -> Result<()> {
        let expected = (self.tile_width * self.tile_height * 4) as usize;
        if pixels.len() != expected {
            bail!(Error::InvalidArgument("pixel buffer has the wrong size"));
        }
        reader::read_tile(self, cache, level, tile_x, tile_y, pixels, pixel_format)
    }

    /// Read an arbitrary region of one level into `pixels`
    /// (`width * height * 4` bytes). Coordinates may reach outside the
    /// level; such pixels come back white.
    pub fn read_region(
        &self,
        cache: &Cache,
        level: i32,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        pixels: &mut [u8],
        pixel_format: PixelFormat,
    ) -> Result<()> {
        if width <= 0 || height <= 0 {
            bail!(Error::InvalidArgument("region is empty"));
        }
        if pixels.len() != (width * height * 4) as usize {
            bail!(Error::InvalidArgument("pixel buffer has the wrong size"));
        }
        let image = self.wsi_image().ok_or(Error::InvalidArgument("no WSI image"))?;
        if level < 0 || level >= image.level_count {
            bail!(Error::InvalidArgument("scale out of range"));
        }

        // The pyramid is shifted by the wavelet padding; region
        // coordinates are expressed relative to the visible origin.
        let num_levels = image.level_count;
        let offset =
            (((PER_LEVEL_PADDING << num_levels) - PER_LEVEL_PADDING) >> level) as i64;
        let x = x + offset;
        let y = y + offset;

        let tile_width = self.tile_width as i64;
        let tile_height = self.tile_height as i64;

        let start_tile_x = x.div_euclid(tile_width);
        let end_tile_x = (x + width - 1).div_euclid(tile_width);
        let start_tile_y = y.div_euclid(tile_height);
        let end_tile_y = (y + height - 1).div_euclid(tile_height);

        let mut tile_pixels = vec![0u8; (tile_width * tile_height * 4) as usize];

        for tile_y_index in start_tile_y..=end_tile_y {
            for tile_x_index in start_tile_x..=end_tile_x {
                self.read_tile(
                    cache,
                    level,
                    tile_x_index,
                    tile_y_index,
                    &mut tile_pixels,
                    pixel_format,
                )?;

                // Intersection of this tile with the region, in level
                // coordinates.
                let tile_origin_x = tile_x_index * tile_width;
                let tile_origin_y = tile_y_index * tile_height;
                let left = x.max(tile_origin_x);
                let top = y.max(tile_origin_y);
                let right = (x + width).min(tile_origin_x + tile_width);
                let bottom = (y + height).min(tile_origin_y + tile_height);
                debug_assert!(left < right && top < bottom);

                let copy_bytes = ((right - left) * 4) as usize;
                for row in top..bottom {
                    let src_start = (((row - tile_origin_y) * tile_width
                        + (left - tile_origin_x))
                        * 4) as usize;
                    let dst_start = (((row - y) * width + (left - x)) * 4) as usize;
                    pixels[dst_start..dst_start + copy_bytes]
                        .copy_from_slice(&tile_pixels[src_start..src_start + copy_bytes]);
                }
            }
        }
        Ok(())
    }

    /// The compressed JPEG bytes of an associated (label/macro) image.
    pub fn associated_image_jpeg(&self, image: &Image) -> Result<Vec<u8>> {
        associated::associated_image_jpeg(self, image)
    }

    /// The raw ICC profile bytes of an image, if the file embeds one. No
    /// color management is applied by this crate.
    pub fn icc_profile(&self, image: &Image) -> Result<Vec<u8>> {
        associated::icc_profile(self, image)
    }

    /// Decode an associated image to RGBA pixels; returns the pixels and
    /// the image dimensions.
    #[cfg(feature = "jpeg")]
    pub fn associated_image_pixels(&self, image: &Image) -> Result<(Vec<u8>, u32, u32)> {
        associated::associated_image_pixels(self, image)
    }
}

impl Cache {
    /// Share this cache's allocators and LRU with an [`Isyntax`] opened
    /// with [`OpenOptions::for_cache`]. Fails with `InvalidArgument`
    /// when the instance already has allocators, and with `Fatal` when
    /// the file's block dimensions disagree with slides injected
    /// earlier.
    pub fn inject(&self, isyntax: &Isyntax) -> Result<()> {
        if isyntax.allocators.get().is_some() {
            bail!(Error::InvalidArgument(
                "isyntax already has allocators (opened without for_cache, or injected twice)",
            ));
        }

        let mut inner = self.inner.lock();
        if inner.allocators.is_none() {
            // Deferred until now: the block size is only known once the
            // first slide arrives.
            inner.allocators = Some(Arc::new(Allocators::new(
                isyntax.block_width,
                isyntax.block_height,
            )));
            inner.allocator_block_width = isyntax.block_width;
            inner.allocator_block_height = isyntax.block_height;
        }
        if inner.allocator_block_width != isyntax.block_width
            || inner.allocator_block_height != isyntax.block_height
        {
            bail!(Error::Fatal("cache and slide block dimensions differ"));
        }

        let allocators = inner.allocators.clone().unwrap();
        if isyntax.allocators.set(allocators).is_err() {
            bail!(Error::InvalidArgument("isyntax was injected concurrently"));
        }
        let slide_id = inner.next_slide_id;
        inner.next_slide_id += 1;
        let _ = isyntax.slide_id.set(slide_id);
        inner.grids.insert(slide_id, isyntax.grid.clone());
        Ok(())
    }
}
