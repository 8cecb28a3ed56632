//! The iSyntax header consumer.
//!
//! The file prefix is an XML document whose `Attribute` leaves carry
//! DICOM `(group, element, PMSVR)` tuples; `DataObject` branches group
//! them into typed objects and `Array` nodes hold repeated children. The
//! consumer drives the byte-level tokenizer, maintains the node and
//! data-object stacks, and fills a [`ParsedHeader`] with everything the
//! decoder needs: image descriptors, block and cluster templates, the
//! codeblock tables, and the file spans of the large base64 payloads.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use memchr::memchr;

use crate::dicom::{
    BlockHeaderTemplate, ClusterHeaderTemplate, ClusterRelativeCoords,
    MAX_CODEBLOCKS_PER_CLUSTER, parse_block_header_table, parse_cluster_header_table,
};
use crate::error::{OpenError, bail};
use crate::image::{CompressorVersion, FileSpan, Image, ImageType};
use crate::xml::{Token, XmlTokenizer};

// Data-object element ids, all in group 0x301D unless noted. There are
// currently no element-id collisions between the groups, so data-object
// flags are keyed on the element alone.
const PIM_DP_SCANNED_IMAGES: u16 = 0x1003;
const DP_IMAGE_POST_PROCESSING: u16 = 0x1014;
const DP_WAVELET_QUANTIZER_SETTINGS_PER_COLOR: u16 = 0x1019;
const DP_WAVELET_QUANTIZER_SETTINGS_PER_LEVEL: u16 = 0x101A;
const UFS_IMAGE_GENERAL_HEADERS: u16 = 0x2000;
const UFS_IMAGE_DIMENSIONS: u16 = 0x2003;
const UFS_IMAGE_BLOCK_HEADER_TEMPLATES: u16 = 0x2009;
const UFS_IMAGE_DIMENSION_RANGES: u16 = 0x200A;
const DP_COLOR_MANAGEMENT: u16 = 0x200B;
const UFS_IMAGE_BLOCK_HEADERS: u16 = 0x200D;
const UFS_IMAGE_CLUSTER_HEADER_TEMPLATES: u16 = 0x2016;
const UFS_IMAGE_VALID_DATA_ENVELOPES: u16 = 0x2023;
const UFS_IMAGE_OPP_EXTREME_VERTICES: u16 = 0x2024;
// Group 0x8B01.
const PIIM_PIXEL_DATA_REPRESENTATION_SEQUENCE: u16 = 0x1001;

const OBJ_DP_UFS_IMPORT: u32 = 1;
const OBJ_DP_SCANNED_IMAGE: u32 = 1 << 1;
const OBJ_UFS_IMAGE_GENERAL_HEADER: u32 = 1 << 2;
const OBJ_UFS_IMAGE_BLOCK_HEADER_TEMPLATE: u32 = 1 << 3;
const OBJ_UFS_IMAGE_DIMENSION: u32 = 1 << 4;
const OBJ_UFS_IMAGE_DIMENSION_RANGE: u32 = 1 << 5;
const OBJ_DP_COLOR_MANAGEMENT: u32 = 1 << 6;
const OBJ_DP_IMAGE_POST_PROCESSING: u32 = 1 << 7;
const OBJ_WAVELET_QUANTIZER_PER_COLOR: u32 = 1 << 8;
const OBJ_WAVELET_QUANTIZER_PER_LEVEL: u32 = 1 << 9;
const OBJ_PIXEL_DATA_REPRESENTATION: u32 = 1 << 10;
const OBJ_UFS_IMAGE_BLOCK_HEADER: u32 = 1 << 11;
const OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE: u32 = 1 << 12;
const OBJ_UFS_IMAGE_VALID_DATA_ENVELOPE: u32 = 1 << 13;
const OBJ_UFS_IMAGE_OPP_EXTREME_VERTEX: u32 = 1 << 14;

fn data_object_flag(element: u16) -> u32 {
    match element {
        0 => OBJ_DP_UFS_IMPORT,
        PIM_DP_SCANNED_IMAGES => OBJ_DP_SCANNED_IMAGE,
        UFS_IMAGE_GENERAL_HEADERS => OBJ_UFS_IMAGE_GENERAL_HEADER,
        UFS_IMAGE_BLOCK_HEADER_TEMPLATES => OBJ_UFS_IMAGE_BLOCK_HEADER_TEMPLATE,
        UFS_IMAGE_DIMENSIONS => OBJ_UFS_IMAGE_DIMENSION,
        UFS_IMAGE_DIMENSION_RANGES => OBJ_UFS_IMAGE_DIMENSION_RANGE,
        DP_COLOR_MANAGEMENT => OBJ_DP_COLOR_MANAGEMENT,
        DP_IMAGE_POST_PROCESSING => OBJ_DP_IMAGE_POST_PROCESSING,
        DP_WAVELET_QUANTIZER_SETTINGS_PER_COLOR => OBJ_WAVELET_QUANTIZER_PER_COLOR,
        DP_WAVELET_QUANTIZER_SETTINGS_PER_LEVEL => OBJ_WAVELET_QUANTIZER_PER_LEVEL,
        PIIM_PIXEL_DATA_REPRESENTATION_SEQUENCE => OBJ_PIXEL_DATA_REPRESENTATION,
        UFS_IMAGE_BLOCK_HEADERS => OBJ_UFS_IMAGE_BLOCK_HEADER,
        UFS_IMAGE_CLUSTER_HEADER_TEMPLATES => OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE,
        UFS_IMAGE_VALID_DATA_ENVELOPES => OBJ_UFS_IMAGE_VALID_DATA_ENVELOPE,
        UFS_IMAGE_OPP_EXTREME_VERTICES => OBJ_UFS_IMAGE_OPP_EXTREME_VERTEX,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NodeType {
    #[default]
    None,
    Leaf,
    Branch,
    Array,
}

#[derive(Debug, Clone, Copy, Default)]
struct ParserNode {
    node_type: NodeType,
    has_children: bool,
    group: u16,
    element: u16,
}

/// Everything extracted from the XML header.
#[derive(Default)]
pub(crate) struct ParsedHeader {
    pub(crate) images: Vec<Image>,
    pub(crate) wsi_image_index: Option<usize>,
    pub(crate) macro_image_index: Option<usize>,
    pub(crate) label_image_index: Option<usize>,
    pub(crate) block_header_templates: Vec<BlockHeaderTemplate>,
    pub(crate) cluster_header_templates: Vec<ClusterHeaderTemplate>,
    pub(crate) mpp_x: f32,
    pub(crate) mpp_y: f32,
    pub(crate) is_mpp_known: bool,
    /// Below 100 for iSyntax format v1 (usually 5), 100 or above for v2.
    pub(crate) data_model_major_version: i32,
    pub(crate) barcode: Option<String>,
}

pub(crate) struct HeaderParser {
    tokenizer: XmlTokenizer,
    node_stack: Vec<ParserNode>,
    data_object_stack: Vec<ParserNode>,
    data_object_flags: u32,
    content: Vec<u8>,
    content_file_offset: u64,
    attr_value: Vec<u8>,
    attribute_index: u32,
    current_group: u16,
    current_element: u16,
    current_node_type: NodeType,
    current_node_has_children: bool,
    dimension_index: i32,
    block_header_index_for_cluster: usize,
    working_block_template: BlockHeaderTemplate,
    working_cluster_template: ClusterHeaderTemplate,
    current_image: Option<usize>,
    out: ParsedHeader,
}

const MAX_NODE_DEPTH: usize = 16;

impl HeaderParser {
    pub(crate) fn new() -> Self {
        Self {
            tokenizer: XmlTokenizer::new(),
            // Root sentinel so that every element inherits a parent.
            node_stack: vec![ParserNode::default()],
            data_object_stack: Vec::new(),
            data_object_flags: 0,
            content: Vec::new(),
            content_file_offset: 0,
            attr_value: Vec::new(),
            attribute_index: 0,
            current_group: 0,
            current_element: 0,
            current_node_type: NodeType::None,
            current_node_has_children: false,
            dimension_index: 0,
            block_header_index_for_cluster: 0,
            working_block_template: BlockHeaderTemplate::default(),
            working_cluster_template: ClusterHeaderTemplate::default(),
            current_image: None,
            out: ParsedHeader::default(),
        }
    }

    /// True while the parser sits inside one of the known huge leaves, so
    /// the caller may bulk-copy content bytes without tokenizing them.
    fn in_big_content(&self) -> bool {
        self.current_node_type == NodeType::Leaf
            && matches!(
                (self.current_group, self.current_element),
                (0x301D, 0x2014) // UFS_IMAGE_BLOCK_HEADER_TABLE
                    | (0x301D, 0x201F) // UFS_IMAGE_CLUSTER_HEADER_TABLE
                    | (0x301D, 0x1005) // PIM_DP_IMAGE_DATA
                    | (0x0028, 0x2000) // DICOM_ICCPROFILE
            )
    }

    /// Feed one header chunk. `chunk_offset` is the chunk's position in
    /// the file, used to record payload spans.
    pub(crate) fn feed(&mut self, chunk: &[u8], chunk_offset: u64) -> Result<(), OpenError> {
        let mut i = 0usize;
        while i < chunk.len() {
            // Bulk path for the giant base64 leaves: copy straight into
            // the content buffer up to the next tag.
            if self.in_big_content() && self.tokenizer.in_character_data() {
                let end = memchr(b'<', &chunk[i..]).map_or(chunk.len(), |p| i + p);
                if end > i {
                    if self.content_file_offset == 0 {
                        self.content_file_offset = chunk_offset + i as u64;
                    }
                    self.content.extend_from_slice(&chunk[i..end]);
                    i = end;
                    continue;
                }
            }

            let c = chunk[i];
            if c == 0 {
                bail!(OpenError::XmlMalformed("NUL byte in header"));
            }
            if let Some(token) = self.tokenizer.push(c)? {
                self.handle_token(token, chunk_offset + i as u64)?;
            }
            i += 1;
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<ParsedHeader, OpenError> {
        if self.out.images.is_empty() {
            bail!(OpenError::XmlMalformed("header describes no images"));
        }
        Ok(self.out)
    }

    fn handle_token(&mut self, token: Token, file_offset: u64) -> Result<(), OpenError> {
        match token {
            Token::ElemStart => self.elem_start(),
            Token::Content => {
                if self.content_file_offset == 0 {
                    self.content_file_offset = file_offset;
                }
                self.content.extend_from_slice(self.tokenizer.data());
                Ok(())
            }
            Token::AttrStart => {
                self.attr_value.clear();
                Ok(())
            }
            Token::AttrVal => {
                self.attr_value.extend_from_slice(self.tokenizer.data());
                Ok(())
            }
            Token::AttrEnd => self.attr_end(),
            Token::ElemEnd => self.elem_end(),
        }
    }

    fn elem_start(&mut self) -> Result<(), OpenError> {
        if self.node_stack.len() >= MAX_NODE_DEPTH {
            bail!(OpenError::XmlMalformed("element nesting too deep"));
        }
        let parent = *self.node_stack.last().unwrap();
        let mut node = ParserNode {
            // Inherit the DICOM tag of the parent node; leaves override
            // it once their attributes are parsed.
            group: parent.group,
            element: parent.element,
            ..ParserNode::default()
        };

        self.content.clear();
        self.content_file_offset = 0;
        self.attribute_index = 0;

        match self.tokenizer.elem_name() {
            "Attribute" => node.node_type = NodeType::Leaf,
            "DataObject" => {
                node.node_type = NodeType::Branch;
                // Remember which data object type this subtree belongs
                // to, so leaves can be routed by the active flag set.
                self.data_object_stack.push(parent);
                self.data_object_flags |= data_object_flag(parent.element);
            }
            "Array" => node.node_type = NodeType::Array,
            other => {
                debug!("unrecognized element '{other}'");
                node.node_type = NodeType::None;
            }
        }

        self.current_node_type = node.node_type;
        self.current_node_has_children = false;
        self.node_stack.push(node);
        Ok(())
    }

    fn attr_end(&mut self) -> Result<(), OpenError> {
        let value = std::mem::take(&mut self.attr_value);
        let value_str = str::from_utf8(&value).unwrap_or("");

        match self.current_node_type {
            NodeType::Leaf => match self.attribute_index {
                0 => {
                    // Name="..." (informational only).
                }
                1 => {
                    // Group="0x....".
                    self.current_group = parse_dicom_tag(value_str);
                    self.node_stack.last_mut().unwrap().group = self.current_group;
                }
                2 => {
                    // Element="0x....".
                    self.current_element = parse_dicom_tag(value_str);
                    self.node_stack.last_mut().unwrap().element = self.current_element;
                }
                3 => {
                    // PMSVR="...". An IDataObjectArray leaf has children;
                    // this is the only chance to dispatch it.
                    if value_str == "IDataObjectArray" {
                        self.current_node_has_children = true;
                        self.node_stack.last_mut().unwrap().has_children = true;
                        self.dispatch_leaf()?;
                    }
                }
                _ => {}
            },
            NodeType::Branch => {
                // A DataObject carries a single ObjectType attribute.
                if value_str == "DPScannedImage" {
                    // A new image begins (WSI, label, or macro).
                    self.current_image = Some(self.out.images.len());
                    self.out.images.push(Image::default());
                }
            }
            _ => {}
        }
        self.attribute_index += 1;
        Ok(())
    }

    fn elem_end(&mut self) -> Result<(), OpenError> {
        if self.current_node_type == NodeType::Leaf && !self.current_node_has_children {
            // Leaf without children: attributes and content are both
            // complete, dispatch the whole tag at once.
            self.dispatch_leaf()?;
        } else {
            match self.current_node_type {
                NodeType::Branch => {
                    let data_object = self
                        .data_object_stack
                        .pop()
                        .ok_or(OpenError::XmlMalformed("unbalanced DataObject"))?;
                    self.data_object_flags &= !data_object_flag(data_object.element);
                    self.finish_data_object(data_object.element)?;
                }
                NodeType::Array => {
                    self.dimension_index = 0;
                }
                _ => {}
            }
        }

        // Pop context back to the parent node.
        if self.node_stack.len() <= 1 {
            bail!(OpenError::XmlMalformed("closing element without start"));
        }
        self.node_stack.pop();
        let restored = *self.node_stack.last().unwrap();
        self.current_node_type = restored.node_type;
        self.current_node_has_children = restored.has_children;
        Ok(())
    }

    /// Bookkeeping done when a `DataObject` of the given parent element
    /// closes.
    fn finish_data_object(&mut self, element: u16) -> Result<(), OpenError> {
        match element {
            UFS_IMAGE_GENERAL_HEADERS => {
                self.dimension_index = 0;
            }
            UFS_IMAGE_BLOCK_HEADER_TEMPLATES => {
                self.out
                    .block_header_templates
                    .push(std::mem::take(&mut self.working_block_template));
                self.dimension_index = 0;
            }
            UFS_IMAGE_DIMENSIONS | UFS_IMAGE_DIMENSION_RANGES => {
                self.dimension_index += 1;
            }
            UFS_IMAGE_BLOCK_HEADERS => {
                if self.data_object_flags & OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE != 0 {
                    // Within a cluster template, each UFSImageBlockHeader
                    // describes one codeblock of the cluster.
                    self.block_header_index_for_cluster += 1;
                    if self.block_header_index_for_cluster > MAX_CODEBLOCKS_PER_CLUSTER {
                        bail!(OpenError::ClusterTableInconsistent);
                    }
                }
            }
            UFS_IMAGE_CLUSTER_HEADER_TEMPLATES => {
                self.finish_cluster_template();
            }
            _ => {}
        }
        Ok(())
    }

    /// Resolve a completed cluster template: apply the base dimension
    /// values, then add each codeblock's raw offsets reordered by the
    /// template's dimension order.
    fn finish_cluster_template(&mut self) {
        let template = &mut self.working_cluster_template;
        template
            .relative_coords
            .truncate(self.block_header_index_for_cluster);
        for relative in &mut template.relative_coords {
            relative.x = template.base_x;
            relative.y = template.base_y;
            relative.color_component = template.base_color_component as u32;
            relative.scale = template.base_scale as u32;
            relative.waveletcoeff = template.base_waveletcoeff as u32;
            for (dimension_index, &dim) in template.dimension_order.iter().enumerate() {
                let raw = relative.raw_coords[dimension_index];
                match dim {
                    0 => relative.x += raw,
                    1 => relative.y += raw,
                    2 => relative.color_component += raw,
                    3 => relative.scale += raw,
                    4 => relative.waveletcoeff += raw,
                    _ => {}
                }
            }
        }
        self.out
            .cluster_header_templates
            .push(std::mem::take(&mut self.working_cluster_template));
        self.dimension_index = 0;
        self.block_header_index_for_cluster = 0;
    }

    fn dispatch_leaf(&mut self) -> Result<(), OpenError> {
        let group = self.current_group;
        let element = self.current_element;
        // Leaves at the DPUfsImport level describe the file; deeper ones
        // describe the image being parsed.
        if self.node_stack.len() == 3 {
            self.ufsimport_child(group, element);
            Ok(())
        } else {
            self.scannedimage_child(group, element)
        }
    }

    fn content_str(&self) -> &str {
        str::from_utf8(&self.content).unwrap_or("")
    }

    fn image_mut(&mut self) -> &mut Image {
        if self.out.images.is_empty() {
            self.out.images.push(Image::default());
            self.current_image = Some(0);
        }
        let index = self.current_image.unwrap_or(0);
        &mut self.out.images[index]
    }

    fn ufsimport_child(&mut self, group: u16, element: u16) {
        match (group, element) {
            (0x301D, 0x1001) => {
                // PIM_DP_UFS_INTERFACE_VERSION: "5.0" for v1 files,
                // "100.5" for v2.
                self.out.data_model_major_version = parse_i32_prefix(self.content_str());
            }
            (0x301D, 0x1002) => {
                // PIM_DP_UFS_BARCODE, base64-encoded.
                if let Ok(decoded) = decode_base64_content(&self.content) {
                    self.out.barcode = String::from_utf8(decoded).ok();
                }
            }
            _ => {
                debug!("unhandled file-level attribute ({group:#06x}, {element:#06x})");
            }
        }
    }

    fn scannedimage_child(&mut self, group: u16, element: u16) -> Result<(), OpenError> {
        match (group, element) {
            (0x0028, 0x2000) => {
                // DICOM_ICCPROFILE.
                let span = FileSpan {
                    offset: self.content_file_offset,
                    len: trimmed_base64_len(&self.content),
                };
                self.image_mut().base64_icc_profile = Some(span);
            }
            (0x0028, 0x2110) => {
                // DICOM_LOSSY_IMAGE_COMPRESSION.
                let lossy = self.content_str().trim() == "01";
                self.image_mut().compression_is_lossy = lossy;
            }
            (0x0028, 0x2112) => {
                // DICOM_LOSSY_IMAGE_COMPRESSION_RATIO.
                let ratio = self.content_str().trim().parse().unwrap_or(0.0);
                self.image_mut().lossy_image_compression_ratio = ratio;
            }
            (0x301D, 0x1004) => {
                // PIM_DP_IMAGE_TYPE: "MACROIMAGE", "LABELIMAGE" or "WSI".
                let index = self.current_image.unwrap_or(0);
                let image_type = match self.content_str() {
                    "MACROIMAGE" => {
                        self.out.macro_image_index = Some(index);
                        ImageType::Macro
                    }
                    "LABELIMAGE" => {
                        self.out.label_image_index = Some(index);
                        ImageType::Label
                    }
                    "WSI" => {
                        self.out.wsi_image_index = Some(index);
                        ImageType::Wsi
                    }
                    other => {
                        warn!("unrecognized image type '{other}'");
                        ImageType::None
                    }
                };
                self.image_mut().image_type = image_type;
            }
            (0x301D, 0x1005) => {
                // PIM_DP_IMAGE_DATA: base64 of the associated JPEG. Only
                // the span is recorded; decoding happens on demand.
                let span = FileSpan {
                    offset: self.content_file_offset,
                    len: trimmed_base64_len(&self.content),
                };
                self.image_mut().base64_jpeg = Some(span);
            }
            (0x301D, 0x2001) => {
                // UFS_IMAGE_NUMBER_OF_BLOCKS. The actual number of stored
                // codeblocks may be lower.
                self.image_mut().number_of_blocks = parse_i32_prefix(self.content_str());
            }
            (0x301D, 0x2007) => {
                // UFS_IMAGE_DIMENSION_SCALE_FACTOR: micrometers per pixel
                // for the x (0) and y (1) dimensions.
                let mpp: f32 = self.content_str().trim().parse().unwrap_or(0.0);
                if self.dimension_index == 0 {
                    self.out.mpp_x = mpp;
                    self.out.is_mpp_known = true;
                } else if self.dimension_index == 1 {
                    self.out.mpp_y = mpp;
                    self.out.is_mpp_known = true;
                }
            }
            (0x301D, 0x200B) => self.dimension_range(),
            (0x301D, 0x200E) => {
                // UFS_IMAGE_BLOCK_COORDINATE. The coordinate order is
                // variable; store raw values and resolve them when the
                // cluster template completes.
                if self.data_object_flags
                    & (OBJ_UFS_IMAGE_BLOCK_HEADER | OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE)
                    != 0
                {
                    let mut coords = [0i32; 5];
                    parse_integers(self.content_str(), &mut coords);
                    let index = self.block_header_index_for_cluster;
                    let template = &mut self.working_cluster_template;
                    if template.relative_coords.len() <= index {
                        template
                            .relative_coords
                            .resize(index + 1, ClusterRelativeCoords::default());
                    }
                    for (slot, &v) in template.relative_coords[index]
                        .raw_coords
                        .iter_mut()
                        .zip(coords.iter())
                    {
                        *slot = v as u32;
                    }
                }
            }
            (0x301D, 0x200F) => {
                // UFS_IMAGE_BLOCK_COMPRESSION_METHOD.
                let method = parse_i32_prefix(self.content_str());
                let version = match method {
                    16 => CompressorVersion::V1,
                    19 => CompressorVersion::V2,
                    other => bail!(OpenError::UnknownCompressor(other)),
                };
                self.image_mut().compressor_version = Some(version);
            }
            (0x301D, 0x2012) => {
                // UFS_IMAGE_BLOCK_HEADER_TEMPLATE_ID.
                if self.data_object_flags
                    & (OBJ_UFS_IMAGE_BLOCK_HEADER | OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE)
                    != 0
                {
                    let id = parse_i32_prefix(self.content_str()) as u32;
                    let index = self.block_header_index_for_cluster;
                    let template = &mut self.working_cluster_template;
                    if template.relative_coords.len() <= index {
                        template
                            .relative_coords
                            .resize(index + 1, ClusterRelativeCoords::default());
                    }
                    template.relative_coords[index].block_header_template_id = id;
                }
            }
            (0x301D, 0x2014) => {
                // UFS_IMAGE_BLOCK_HEADER_TABLE (v1 only, mutually
                // exclusive with the cluster header table).
                let decoded = decode_base64_content(&self.content)?;
                let (codeblocks, partial) = parse_block_header_table(&decoded)?;
                let image = self.image_mut();
                image.codeblocks = codeblocks;
                image.header_codeblocks_are_partial = partial;
            }
            (0x301D, 0x201F) => {
                // UFS_IMAGE_CLUSTER_HEADER_TABLE (v2 only).
                let decoded = decode_base64_content(&self.content)?;
                let declared = self.image_mut().number_of_blocks.max(0) as usize;
                let (codeblocks, chunks) = parse_cluster_header_table(
                    &decoded,
                    &self.out.cluster_header_templates,
                    declared,
                )?;
                let image = self.image_mut();
                image.codeblocks = codeblocks;
                image.data_chunks = chunks;
                image.header_codeblocks_are_partial = false;
            }
            (0x301D, 0x2021) => {
                // UFS_IMAGE_DIMENSIONS_IN_CLUSTER. Philips' documentation
                // says element 0x1021, but sample files use 0x2021.
                let mut order = [0i32; 5];
                let count = parse_integers(self.content_str(), &mut order);
                self.working_cluster_template.dimension_order =
                    order[..count].iter().copied().collect();
            }
            _ => {
                debug!("unhandled image attribute ({group:#06x}, {element:#06x})");
            }
        }
        Ok(())
    }

    /// UFS_IMAGE_DIMENSION_RANGE: `start step end`. Which object the
    /// range belongs to decides its meaning.
    fn dimension_range(&mut self) {
        let mut values = [0i32; 3];
        parse_integers(self.content_str(), &mut values);
        let [start, step, end] = values;
        let step_nonzero = if step != 0 { step } else { 1 };
        let numsteps = ((end + step) - start) / step_nonzero;

        if self.data_object_flags & OBJ_UFS_IMAGE_BLOCK_HEADER_TEMPLATE != 0 {
            let template = &mut self.working_block_template;
            match self.dimension_index {
                0 => template.block_width = numsteps as u32,
                1 => template.block_height = numsteps as u32,
                2 => template.color_component = start as u8,
                3 => template.scale = start as u8,
                4 => template.waveletcoeff = if start == 0 { 1 } else { 3 },
                _ => {}
            }
        } else if self.data_object_flags & OBJ_UFS_IMAGE_GENERAL_HEADER != 0 {
            let dimension_index = self.dimension_index;
            let image = self.image_mut();
            match dimension_index {
                0 => {
                    image.offset_x = start;
                    image.width_including_padding = numsteps;
                }
                1 => {
                    image.offset_y = start;
                    image.height_including_padding = numsteps;
                }
                // Dimension 2 is always the 3 color channels.
                3 => {
                    image.level_count = numsteps;
                    image.max_scale = numsteps - 1;
                    let level_padding =
                        (crate::codeblock::PER_LEVEL_PADDING << numsteps) - crate::codeblock::PER_LEVEL_PADDING;
                    image.width = image.width_including_padding - 2 * level_padding;
                    image.height = image.height_including_padding - 2 * level_padding;
                }
                // Dimension 4 is always the 4 wavelet coefficients.
                _ => {}
            }
        } else if self.data_object_flags & OBJ_UFS_IMAGE_CLUSTER_HEADER_TEMPLATE != 0 {
            // The range starts provide the base values that the
            // per-codeblock coordinate offsets are added to.
            let template = &mut self.working_cluster_template;
            match self.dimension_index {
                0 => template.base_x = start as u32,
                1 => template.base_y = start as u32,
                2 => template.base_color_component = start as u8,
                3 => template.base_scale = start as u8,
                4 => template.base_waveletcoeff = start as u8,
                _ => {}
            }
        }
    }
}

/// Parse a `0x....` DICOM group/element attribute value.
fn parse_dicom_tag(value: &str) -> u16 {
    let value = value.trim();
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).unwrap_or(0) as u16
}

/// Parse the leading integer of a string, ignoring anything after it.
fn parse_i32_prefix(value: &str) -> i32 {
    let value = value.trim_start();
    let end = value
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && c == '-'))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    value[..end].parse().unwrap_or(0)
}

/// Parse up to `out.len()` whitespace-separated integers; returns how
/// many were found.
fn parse_integers(value: &str, out: &mut [i32]) -> usize {
    let mut count = 0;
    for part in value.split_ascii_whitespace() {
        if count >= out.len() {
            break;
        }
        if let Ok(v) = part.parse() {
            out[count] = v;
            count += 1;
        }
    }
    count
}

/// Length of the content once trailing `/` and whitespace are dropped;
/// a stray final character would otherwise break base64 decoding.
fn trimmed_base64_len(content: &[u8]) -> usize {
    let mut end = content.len();
    while end > 0 && matches!(content[end - 1], b'/' | b'\n' | b'\r' | b' ') {
        end -= 1;
    }
    end
}

pub(crate) fn decode_base64_content(content: &[u8]) -> Result<Vec<u8>, OpenError> {
    let end = trimmed_base64_len(content);
    BASE64
        .decode(&content[..end])
        .map_err(|_| OpenError::Base64("embedded table payload"))
}

/// Read the file prefix in chunks until the `0x04` end-of-header marker,
/// feeding each chunk to the header parser. Returns the parsed header and
/// the offset of the byte after the marker (the seektable or codeblock
/// data).
pub(crate) fn parse_file_header(
    file: &crate::file::FileHandle,
) -> Result<(ParsedHeader, u64), OpenError> {
    const READ_SIZE: usize = 1 << 20;

    let mut parser = HeaderParser::new();
    let mut buffer = vec![0u8; READ_SIZE];
    let mut offset = 0u64;

    loop {
        let remaining = file.size().saturating_sub(offset);
        if remaining == 0 {
            bail!(OpenError::HeaderTerminatorNotFound);
        }
        let read_len = (remaining as usize).min(READ_SIZE);
        let chunk = &mut buffer[..read_len];
        file.read_at(chunk, offset)?;

        if let Some(marker) = memchr(0x04, chunk) {
            parser.feed(&chunk[..marker], offset)?;
            let data_offset = offset + marker as u64 + 1;
            let header = parser.finish()?;
            return Ok((header, data_offset));
        }

        parser.feed(chunk, offset)?;
        offset += read_len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn general_header(width: i32, height: i32, levels: i32) -> String {
        let ranges = [
            format!("0 1 {}", width - 1),
            format!("0 1 {}", height - 1),
            "0 1 2".to_string(),
            format!("0 1 {}", levels - 1),
            "0 1 3".to_string(),
        ];
        let ranges: String = ranges.iter().map(|r| dimension_range(r)).collect();
        format!(
            "<Attribute Name=\"UFS_IMAGE_GENERAL_HEADERS\" Group=\"0x301D\" Element=\"0x2000\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"UFSImageGeneralHeader\">{}</DataObject></Array></Attribute>",
            format!(
                "<Attribute Name=\"UFS_IMAGE_DIMENSION_RANGES\" Group=\"0x301D\" Element=\"0x200A\" PMSVR=\"IDataObjectArray\"><Array>{ranges}</Array></Attribute>"
            )
        )
    }

    fn block_template(block: i32) -> String {
        let ranges = [
            format!("0 1 {}", block - 1),
            format!("0 1 {}", block - 1),
            "0 0 0".to_string(),
            "0 0 0".to_string(),
            "1 1 3".to_string(),
        ];
        let ranges: String = ranges.iter().map(|r| dimension_range(r)).collect();
        format!(
            "<Attribute Name=\"UFS_IMAGE_BLOCK_HEADER_TEMPLATES\" Group=\"0x301D\" Element=\"0x2009\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"UFSImageBlockHeaderTemplate\"><Attribute Name=\"UFS_IMAGE_DIMENSION_RANGES\" Group=\"0x301D\" Element=\"0x200A\" PMSVR=\"IDataObjectArray\"><Array>{ranges}</Array></Attribute></DataObject></Array></Attribute>"
        )
    }

    fn minimal_header() -> String {
        let mut wsi = String::new();
        wsi.push_str(&attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "IString", "WSI"));
        wsi.push_str(&general_header(70, 70, 1));
        wsi.push_str(&block_template(16));
        wsi.push_str(&attribute(
            "UFS_IMAGE_BLOCK_COMPRESSION_METHOD",
            0x301D,
            0x200F,
            "IString",
            "16",
        ));
        format!(
            "<?xml version=\"1.0\"?><DataObject ObjectType=\"DPUfsImport\">{}{}</DataObject>",
            attribute("PIM_DP_UFS_INTERFACE_VERSION", 0x301D, 0x1001, "IString", "5.0"),
            format!(
                "<Attribute Name=\"PIM_DP_SCANNED_IMAGES\" Group=\"0x301D\" Element=\"0x1003\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"DPScannedImage\">{wsi}</DataObject></Array></Attribute>"
            )
        )
    }

    fn parse(doc: &str) -> ParsedHeader {
        let mut parser = HeaderParser::new();
        parser.feed(doc.as_bytes(), 0).unwrap();
        parser.finish().unwrap()
    }

    #[test]
    fn minimal_wsi_header() {
        let header = parse(&minimal_header());
        assert_eq!(header.data_model_major_version, 5);
        assert_eq!(header.wsi_image_index, Some(0));
        let image = &header.images[0];
        assert_eq!(image.image_type, ImageType::Wsi);
        assert_eq!(image.width_including_padding, 70);
        assert_eq!(image.level_count, 1);
        assert_eq!(image.max_scale, 0);
        // width = padded width minus 2 * ((3 << 1) - 3).
        assert_eq!(image.width, 70 - 2 * 3);
        assert_eq!(
            image.compressor_version,
            Some(crate::image::CompressorVersion::V1)
        );
        assert_eq!(header.block_header_templates.len(), 1);
        let template = &header.block_header_templates[0];
        assert_eq!(template.block_width, 16);
        assert_eq!(template.block_height, 16);
        assert_eq!(template.waveletcoeff, 3);
    }

    #[test]
    fn header_survives_chunked_feeding() {
        let doc = minimal_header();
        let bytes = doc.as_bytes();
        for split in [1usize, 7, 63, bytes.len() / 2] {
            let mut parser = HeaderParser::new();
            let mut offset = 0u64;
            for part in bytes.chunks(split) {
                parser.feed(part, offset).unwrap();
                offset += part.len() as u64;
            }
            let header = parser.finish().unwrap();
            assert_eq!(header.block_header_templates.len(), 1, "split {split}");
        }
    }

    #[test]
    fn number_parsing_helpers() {
        assert_eq!(parse_i32_prefix("100.5"), 100);
        assert_eq!(parse_i32_prefix("5.0"), 5);
        assert_eq!(parse_i32_prefix("  42abc"), 42);
        assert_eq!(parse_i32_prefix("-3"), -3);
        assert_eq!(parse_dicom_tag("0x301D"), 0x301D);
        assert_eq!(parse_dicom_tag("0x301d"), 0x301D);

        let mut out = [0i32; 5];
        assert_eq!(parse_integers("0 2046 1", &mut out), 3);
        assert_eq!(&out[..3], &[0, 2046, 1]);
    }

    #[test]
    fn mpp_is_captured_per_dimension() {
        // Two UFSImageDimension objects, each carrying a scale factor.
        let dims = format!(
            "<Attribute Name=\"UFS_IMAGE_DIMENSIONS\" Group=\"0x301D\" Element=\"0x2003\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"UFSImageDimension\">{}</DataObject><DataObject ObjectType=\"UFSImageDimension\">{}</DataObject></Array></Attribute>",
            attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, "IString", "0.25"),
            attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, "IString", "0.5"),
        );
        let doc = format!(
            "<DataObject ObjectType=\"DPUfsImport\"><Attribute Name=\"PIM_DP_SCANNED_IMAGES\" Group=\"0x301D\" Element=\"0x1003\" PMSVR=\"IDataObjectArray\"><Array><DataObject ObjectType=\"DPScannedImage\">{}{dims}</DataObject></Array></Attribute></DataObject>",
            attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "IString", "WSI"),
        );
        let header = parse(&doc);
        assert!(header.is_mpp_known);
        assert_eq!(header.mpp_x, 0.25);
        assert_eq!(header.mpp_y, 0.5);
    }
}
