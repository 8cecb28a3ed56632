//! End-to-end tests over synthetic iSyntax files written to disk.
//!
//! Two fixtures cover the two v1 header layouts: a single-tile slide
//! with partial block headers resolved through the seektable (whose
//! declared size is the `-1` "guess" case), and a 32-tile slide with
//! full inline block headers.

use std::io::Write;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use pathview_isyntax::{
    Cache, CameraBounds, CompletionQueue, Isyntax, OpenOptions, PixelFormat, Streamer, WorkerPool,
};
use tempfile::NamedTempFile;

const BLOCK: usize = 8;
const TILE: usize = BLOCK * 2;

// ---------------------------------------------------------------------
// Binary building blocks
// ---------------------------------------------------------------------

fn tag(group: u16, element: u16, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&group.to_le_bytes());
    out.extend_from_slice(&element.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

/// LSB-first bitstream writer matching the Hulsken bit order.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: usize,
}

impl BitWriter {
    fn put(&mut self, value: u64, count: usize) {
        for i in 0..count {
            let bit = (value >> i) & 1;
            if self.bit_pos % 8 == 0 {
                self.bytes.push(0);
            }
            *self.bytes.last_mut().unwrap() |= (bit as u8) << (self.bit_pos % 8);
            self.bit_pos += 1;
        }
    }
}

/// A v1 codeblock whose 8x8 coefficients all equal `value` (positive,
/// two's complement). Encoded with a two-symbol Huffman tree and exact
/// zero-run stretches.
fn constant_ll_codeblock(value: u16) -> Vec<u8> {
    assert!(value < 0x8000);
    let plane_bytes = BLOCK * BLOCK / 8;
    let serialized = 16 * plane_bytes;

    let mut w = BitWriter::default();
    w.bytes.extend_from_slice(&(serialized as u32).to_le_bytes());
    w.bytes.push(0x00); // zero-run symbol
    w.bytes.push(8); // zero-run counter bits
    w.bit_pos = w.bytes.len() * 8;

    // Tree: descend, leaf 0x00 (code "0"), leaf 0xFF (code "1").
    w.put(0, 1);
    w.put(1, 1);
    w.put(0x00, 8);
    w.put(1, 1);
    w.put(0xFF, 8);

    // v1 plane order: sign, then magnitude LSB..MSB. Emit zero planes as
    // one run per stretch (consecutive run symbols would merge their
    // counters), 0xFF literals for planes whose magnitude bit is set.
    let plane_is_set = |index: usize| index > 0 && (value >> (index - 1)) & 1 != 0;
    let mut index = 0usize;
    while index < 16 {
        if plane_is_set(index) {
            for _ in 0..plane_bytes {
                w.put(1, 1);
            }
            index += 1;
        } else {
            let mut stretch = 0usize;
            while index < 16 && !plane_is_set(index) {
                stretch += 1;
                index += 1;
            }
            w.put(0, 1);
            w.put((stretch * plane_bytes) as u64, 8);
        }
    }
    w.bytes
}

/// An empty (all-zero) codeblock: anything of 8 bytes or less.
fn empty_codeblock() -> Vec<u8> {
    vec![0u8; 8]
}

// ---------------------------------------------------------------------
// XML building blocks
// ---------------------------------------------------------------------

fn attribute(name: &str, group: u16, element: u16, pmsvr: &str, content: &str) -> String {
    format!(
        "<Attribute Name=\"{name}\" Group=\"0x{group:04X}\" Element=\"0x{element:04X}\" PMSVR=\"{pmsvr}\">{content}</Attribute>"
    )
}

fn dimension_range(value: &str) -> String {
    format!(
        "<DataObject ObjectType=\"UFSImageDimensionRange\">{}</DataObject>",
        attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "IString", value)
    )
}

fn range_array(ranges: &[String]) -> String {
    let body: String = ranges.iter().map(|r| dimension_range(r)).collect();
    format!(
        "<Attribute Name=\"UFS_IMAGE_DIMENSION_RANGES\" Group=\"0x301D\" Element=\"0x200A\" PMSVR=\"IDataObjectArray\"><Array>{body}</Array></Attribute>"
    )
}

fn wsi_image_xml(
    width_including_padding: usize,
    height_including_padding: usize,
    block_header_table_base64: &str,
) -> String {
    let general = format!(
        "<Attribute Name=\"UFS_IMAGE_GENERAL_HEADERS\" Group=\"0x301D\" Element=\"0x2000\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"UFSImageGeneralHeader\">{}</DataObject></Array></Attribute>",
        range_array(&[
            format!("0 1 {}", width_including_padding - 1),
            format!("0 1 {}", height_including_padding - 1),
            "0 1 2".to_string(),
            "0 1 0".to_string(), // a single level
            "0 1 3".to_string(),
        ])
    );
    let template = format!(
        "<Attribute Name=\"UFS_IMAGE_BLOCK_HEADER_TEMPLATES\" Group=\"0x301D\" Element=\"0x2009\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"UFSImageBlockHeaderTemplate\">{}</DataObject></Array></Attribute>",
        range_array(&[
            format!("0 1 {}", BLOCK - 1),
            format!("0 1 {}", BLOCK - 1),
            "0 0 0".to_string(),
            "0 0 0".to_string(),
            "1 1 3".to_string(),
        ])
    );
    format!(
        "{}{general}{template}{}{}",
        attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "IString", "WSI"),
        attribute(
            "UFS_IMAGE_BLOCK_COMPRESSION_METHOD",
            0x301D,
            0x200F,
            "IString",
            "16"
        ),
        attribute(
            "UFS_IMAGE_BLOCK_HEADER_TABLE",
            0x301D,
            0x2014,
            "IString",
            block_header_table_base64
        ),
    )
}

fn file_xml(wsi: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><DataObject ObjectType=\"DPUfsImport\">{}{}</DataObject>",
        attribute("PIM_DP_UFS_INTERFACE_VERSION", 0x301D, 0x1001, "IString", "5.0"),
        format!(
            "<Attribute Name=\"PIM_DP_SCANNED_IMAGES\" Group=\"0x301D\" Element=\"0x1003\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"DPScannedImage\">{wsi}</DataObject></Array></Attribute>"
        )
    )
}

// ---------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------

struct CodeblockDesc {
    x: u32,
    y: u32,
    color: u32,
    coefficient: u32,
    data: Vec<u8>,
}

/// The six codeblocks of one single-tile chunk at `(bx, by)`: per color
/// an H triplet block followed by the LL block.
fn chunk_codeblocks(bx: u32, by: u32, ll_values: [u16; 3]) -> Vec<CodeblockDesc> {
    let tile = TILE as u32;
    let mut out = Vec::new();
    for color in 0..3u32 {
        out.push(CodeblockDesc {
            x: 1 + bx * tile,
            y: 1 + by * tile,
            color,
            coefficient: 1,
            data: empty_codeblock(),
        });
        let value = ll_values[color as usize];
        out.push(CodeblockDesc {
            x: 2 + bx * tile,
            y: 2 + by * tile,
            color,
            coefficient: 0,
            data: if value == 0 {
                empty_codeblock()
            } else {
                constant_ll_codeblock(value)
            },
        });
    }
    out
}

fn partial_block_header_record(desc: &CodeblockDesc) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(&tag(0xFFFE, 0xE000, 40));
    out.extend_from_slice(&tag(0x301D, 0x200E, 20));
    for v in [desc.x, desc.y, desc.color, 0, desc.coefficient] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&tag(0x301D, 0x2012, 4));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

fn full_block_header_record(desc: &CodeblockDesc, offset: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(&tag(0xFFFE, 0xE000, 72));
    out.extend_from_slice(&tag(0x301D, 0x200E, 20));
    for v in [desc.x, desc.y, desc.color, 0, desc.coefficient] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&tag(0x301D, 0x2010, 8));
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&tag(0x301D, 0x2011, 8));
    out.extend_from_slice(&(desc.data.len() as u64).to_le_bytes());
    out.extend_from_slice(&tag(0x301D, 0x2012, 4));
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// A 1-tile slide (16x16 padded to one tile), partial block headers, a
/// seektable with the declared-size-unknown quirk, and LL values that
/// give recognizable colors.
fn single_tile_fixture() -> NamedTempFile {
    let descs = chunk_codeblocks(0, 0, [200, 40, 0]);

    let mut table = Vec::new();
    table.extend_from_slice(&((descs.len() * 48) as u32).to_le_bytes());
    for desc in &descs {
        table.extend_from_slice(&partial_block_header_record(desc));
    }
    let xml = file_xml(&wsi_image_xml(16, 16, &BASE64.encode(&table)));

    // Layout after the header terminator: seektable tag + entries, then
    // the codeblock data.
    let seektable_entries = descs.len();
    let data_start = xml.len() as u64 + 1 + 8 + (seektable_entries * 40) as u64;

    // block ids: H codeblocks (scale 0) come first per color, the LL
    // codeblocks one "virtual level" later; the table repeats per color.
    // With a 1x1 grid: H -> id color*2, LL -> id color*2 + 1.
    let mut offsets = vec![(0u64, 0u64); seektable_entries];
    let mut running = data_start;
    for desc in &descs {
        let id = (desc.color * 2 + if desc.coefficient == 0 { 1 } else { 0 }) as usize;
        offsets[id] = (running, desc.data.len() as u64);
        running += desc.data.len() as u64;
    }

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(xml.as_bytes()).unwrap();
    file.write_all(&[0x04]).unwrap();
    // Declared size -1: readers must fall back to guessing from the
    // codeblock count.
    file.write_all(&tag(0x301D, 0x2015, u32::MAX)).unwrap();
    for &(offset, size) in &offsets {
        file.write_all(&tag(0xFFFE, 0xE000, 32)).unwrap();
        file.write_all(&tag(0x301D, 0x2010, 8)).unwrap();
        file.write_all(&offset.to_le_bytes()).unwrap();
        file.write_all(&tag(0x301D, 0x2011, 8)).unwrap();
        file.write_all(&size.to_le_bytes()).unwrap();
    }
    for desc in &descs {
        file.write_all(&desc.data).unwrap();
    }
    file.flush().unwrap();
    file
}

/// An 8x4-tile slide with full inline block headers (no seektable).
fn grid_fixture() -> NamedTempFile {
    let mut descs = Vec::new();
    for by in 0..4u32 {
        for bx in 0..8u32 {
            descs.extend(chunk_codeblocks(bx, by, [128, 0, 0]));
        }
    }

    // The table embeds absolute offsets, which depend on the header
    // length; the header length only depends on the table's size, so one
    // dry run settles the layout.
    let build_xml = |offsets: &[u64]| {
        let mut table = Vec::new();
        table.extend_from_slice(&((descs.len() * 80) as u32).to_le_bytes());
        for (desc, &offset) in descs.iter().zip(offsets) {
            table.extend_from_slice(&full_block_header_record(desc, offset));
        }
        file_xml(&wsi_image_xml(128, 64, &BASE64.encode(&table)))
    };

    let dry_run = build_xml(&vec![0u64; descs.len()]);
    let data_start = dry_run.len() as u64 + 1;
    let mut offsets = Vec::with_capacity(descs.len());
    let mut running = data_start;
    for desc in &descs {
        offsets.push(running);
        running += desc.data.len() as u64;
    }
    let xml = build_xml(&offsets);
    assert_eq!(xml.len(), dry_run.len());

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(xml.as_bytes()).unwrap();
    file.write_all(&[0x04]).unwrap();
    for desc in &descs {
        file.write_all(&desc.data).unwrap();
    }
    file.flush().unwrap();
    file
}

fn open_with_cache(file: &NamedTempFile, target_size: usize) -> (Isyntax, Cache) {
    let isyntax = Isyntax::open(file.path(), OpenOptions::for_cache()).unwrap();
    let cache = Cache::new(Some("test"), target_size);
    cache.inject(&isyntax).unwrap();
    (isyntax, cache)
}

fn tile_buffer() -> Vec<u8> {
    vec![0u8; TILE * TILE * 4]
}

// ---------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------

#[test]
fn open_reads_geometry_from_the_header() {
    let file = single_tile_fixture();
    let isyntax = Isyntax::open(file.path(), OpenOptions::default()).unwrap();

    assert_eq!(isyntax.tile_width(), TILE as i32);
    assert_eq!(isyntax.tile_height(), TILE as i32);
    assert_eq!(isyntax.data_model_major_version(), 5);
    assert!(!isyntax.is_mpp_known());

    let wsi = isyntax.wsi_image().unwrap();
    assert_eq!(wsi.level_count(), 1);
    // Padded 16 minus twice the level padding of 3.
    assert_eq!(wsi.width(), 10);
    assert_eq!(wsi.height(), 10);
    let level = wsi.level(0).unwrap();
    assert_eq!(level.width_in_tiles(), 1);
    assert_eq!(level.height_in_tiles(), 1);
}

#[test]
fn tile_read_decodes_constant_ll_blocks() {
    let file = single_tile_fixture();
    let (isyntax, cache) = open_with_cache(&file, 64);

    let mut rgba = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut rgba, PixelFormat::Rgba)
        .unwrap();

    // Y = 200, Co = 40, Cg = 0:
    // tmp = 200, G = 200, B = 200 - 20 = 180, R = 180 + 40 = 220.
    // Interior pixels are unaffected by the dummy borders.
    for (x, y) in [(7, 7), (8, 8), (6, 9)] {
        let p = &rgba[(y * TILE + x) * 4..(y * TILE + x) * 4 + 4];
        assert_eq!(p, [220, 200, 180, 0xFF], "pixel ({x}, {y})");
    }
    // Alpha is opaque everywhere.
    for pixel in rgba.chunks_exact(4) {
        assert_eq!(pixel[3], 0xFF);
    }

    // BGRA is the channel swap of RGBA, pixel for pixel.
    let mut bgra = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut bgra, PixelFormat::Bgra)
        .unwrap();
    for (p_rgba, p_bgra) in rgba.chunks_exact(4).zip(bgra.chunks_exact(4)) {
        assert_eq!(p_rgba[0], p_bgra[2]);
        assert_eq!(p_rgba[1], p_bgra[1]);
        assert_eq!(p_rgba[2], p_bgra[0]);
        assert_eq!(p_rgba[3], p_bgra[3]);
    }

    // Repeated reads are byte-identical.
    let mut again = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut again, PixelFormat::Rgba)
        .unwrap();
    assert_eq!(rgba, again);
}

#[test]
fn reopening_the_file_is_deterministic() {
    let file = single_tile_fixture();

    let mut first = tile_buffer();
    {
        let (isyntax, cache) = open_with_cache(&file, 64);
        isyntax
            .read_tile(&cache, 0, 0, 0, &mut first, PixelFormat::Bgra)
            .unwrap();
    }

    let mut second = tile_buffer();
    {
        let (isyntax, cache) = open_with_cache(&file, 64);
        isyntax
            .read_tile(&cache, 0, 0, 0, &mut second, PixelFormat::Bgra)
            .unwrap();
    }
    assert_eq!(first, second);
}

#[test]
fn out_of_range_requests_are_white_or_rejected() {
    let file = single_tile_fixture();
    let (isyntax, cache) = open_with_cache(&file, 64);

    let mut pixels = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 5, 0, &mut pixels, PixelFormat::Rgba)
        .unwrap();
    assert!(pixels.iter().all(|&b| b == 0xFF), "outside the grid: white");

    isyntax
        .read_tile(&cache, 0, -1, 2, &mut pixels, PixelFormat::Rgba)
        .unwrap();
    assert!(pixels.iter().all(|&b| b == 0xFF));

    // An invalid scale is a caller error, not a white tile.
    assert!(
        isyntax
            .read_tile(&cache, 3, 0, 0, &mut pixels, PixelFormat::Rgba)
            .is_err()
    );
    // So is a wrongly sized buffer.
    let mut small = vec![0u8; 16];
    assert!(
        isyntax
            .read_tile(&cache, 0, 0, 0, &mut small, PixelFormat::Rgba)
            .is_err()
    );
}

#[test]
fn read_region_matches_tile_read() {
    let file = single_tile_fixture();
    let (isyntax, cache) = open_with_cache(&file, 64);

    let mut tile = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut tile, PixelFormat::Rgba)
        .unwrap();

    // Region coordinates are shifted against tile space by the level
    // padding (3 at level 0 of a one-level pyramid).
    let (w, h) = (6i64, 5i64);
    let (x, y) = (2i64, 1i64);
    let mut region = vec![0u8; (w * h * 4) as usize];
    isyntax
        .read_region(&cache, 0, x, y, w, h, &mut region, PixelFormat::Rgba)
        .unwrap();

    for row in 0..h {
        for col in 0..w {
            let tile_x = (x + col + 3) as usize;
            let tile_y = (y + row + 3) as usize;
            let expected = &tile[(tile_y * TILE + tile_x) * 4..][..4];
            let got = &region[((row * w + col) * 4) as usize..][..4];
            assert_eq!(expected, got, "pixel ({col}, {row})");
        }
    }
}

#[test]
fn grid_fixture_links_tiles_and_chunks() {
    let file = grid_fixture();
    let (isyntax, cache) = open_with_cache(&file, 1024);

    let wsi = isyntax.wsi_image().unwrap();
    let level = wsi.level(0).unwrap();
    assert_eq!(level.width_in_tiles(), 8);
    assert_eq!(level.height_in_tiles(), 4);

    // Every tile decodes to the same constant gray interior.
    let mut pixels = tile_buffer();
    for (tile_x, tile_y) in [(0i64, 0i64), (7, 3), (3, 2)] {
        isyntax
            .read_tile(&cache, 0, tile_x, tile_y, &mut pixels, PixelFormat::Rgba)
            .unwrap();
        let center = &pixels[(8 * TILE + 8) * 4..][..4];
        assert_eq!(center, [128, 128, 128, 0xFF], "tile ({tile_x}, {tile_y})");
    }
}

#[test]
fn cache_eviction_keeps_residency_bounded() {
    let file = grid_fixture();
    let target = 16usize;
    let (isyntax, cache) = open_with_cache(&file, target);

    let mut pixels = tile_buffer();
    for tile_y in 0..4i64 {
        for tile_x in 0..8i64 {
            isyntax
                .read_tile(&cache, 0, tile_x, tile_y, &mut pixels, PixelFormat::Bgra)
                .unwrap();
            assert!(
                cache.resident_tile_count() <= target,
                "residency exceeded the target after ({tile_x}, {tile_y})"
            );
        }
    }
    assert_eq!(cache.resident_tile_count(), target);

    // Evicted tiles reload transparently and identically.
    let mut first = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut first, PixelFormat::Bgra)
        .unwrap();
    let mut second = tile_buffer();
    isyntax
        .read_tile(&cache, 0, 0, 0, &mut second, PixelFormat::Bgra)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn double_injection_is_rejected() {
    let file = single_tile_fixture();
    let isyntax = Isyntax::open(file.path(), OpenOptions::for_cache()).unwrap();
    let cache = Cache::new(None, 16);
    cache.inject(&isyntax).unwrap();
    assert!(cache.inject(&isyntax).is_err());

    // An instance that owns its allocators cannot be injected either.
    let owned = Isyntax::open(file.path(), OpenOptions::default()).unwrap();
    assert!(cache.inject(&owned).is_err());
}

#[test]
fn streamer_first_load_emits_all_top_tiles() {
    let file = grid_fixture();
    let isyntax = Arc::new(Isyntax::open(file.path(), OpenOptions::default()).unwrap());
    let pool = WorkerPool::new("stream-test", Some(1));
    let completions = Arc::new(CompletionQueue::new());

    let mut streamer = Streamer::new(
        isyntax.clone(),
        pool.queue().clone(),
        completions.clone(),
        1,
        PixelFormat::Rgba,
    );
    streamer.stream().unwrap();
    assert!(!streamer.in_progress());

    let mut seen = std::collections::HashSet::new();
    while let Some(completion) = completions.poll() {
        assert_eq!(completion.resource_id, 1);
        assert_eq!(completion.pixels.len(), TILE * TILE * 4);
        assert!(seen.insert((completion.scale, completion.tile_x, completion.tile_y)));
    }
    // The single-level pyramid has 32 top tiles, all delivered by the
    // first load.
    assert_eq!(seen.len(), 32);
}

#[test]
fn streamer_preemption_returns_within_the_frame() {
    let file = grid_fixture();
    let isyntax = Arc::new(Isyntax::open(file.path(), OpenOptions::default()).unwrap());
    let pool = WorkerPool::new("stream-preempt", Some(1));
    let completions = Arc::new(CompletionQueue::new());

    let mut streamer = Streamer::new(
        isyntax.clone(),
        pool.queue().clone(),
        completions.clone(),
        2,
        PixelFormat::Rgba,
    );
    streamer.stream().unwrap(); // first load
    streamer.set_viewport(
        CameraBounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 64.0,
            max_y: 64.0,
        },
        0,
        2,
    );

    // With the frame flag raised, the streamer must yield immediately.
    streamer.frame_boundary_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    let start = std::time::Instant::now();
    streamer.stream().unwrap();
    assert!(start.elapsed() < std::time::Duration::from_millis(200));
    assert!(streamer.in_progress());

    // Cleared flag: the step runs to completion.
    streamer.frame_boundary_flag().store(false, std::sync::atomic::Ordering::Relaxed);
    streamer.stream().unwrap();
    assert!(!streamer.in_progress());
}
