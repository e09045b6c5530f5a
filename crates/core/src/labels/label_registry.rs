use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelRegistryError {
    #[error("failed to read label file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid label file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("class id {0} is defined more than once")]
    DuplicateId(u32),
}

/// RGB display color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub [u8; 3]);

impl Color {
    /// Perceived brightness (ITU-R BT.601 weights), 0-255.
    pub fn luma(&self) -> u8 {
        let [r, g, b] = self.0;
        ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
    }

    /// Black or white, whichever reads better on top of `self`.
    pub fn contrasting_text(&self) -> Color {
        if self.luma() > 140 {
            Color([0, 0, 0])
        } else {
            Color([255, 255, 255])
        }
    }
}

pub const DEFAULT_COLOR: Color = Color([255, 255, 255]);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub id: u32,
    pub name: String,
    pub color: Color,
}

/// Result of resolving a class id.
///
/// Unknown ids are a normal, typed outcome: the annotator still draws them
/// with the registry's default color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LabelEntry<'a> {
    Known { id: u32, name: &'a str, color: Color },
    Unknown { id: u32, color: Color },
}

impl LabelEntry<'_> {
    pub fn id(&self) -> u32 {
        match self {
            LabelEntry::Known { id, .. } | LabelEntry::Unknown { id, .. } => *id,
        }
    }

    pub fn color(&self) -> Color {
        match self {
            LabelEntry::Known { color, .. } | LabelEntry::Unknown { color, .. } => *color,
        }
    }

    pub fn name(&self) -> Cow<'_, str> {
        match self {
            LabelEntry::Known { name, .. } => Cow::Borrowed(*name),
            LabelEntry::Unknown { id, .. } => Cow::Owned(format!("class {id}")),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LabelFile {
    classes: Vec<ClassInfo>,
    #[serde(default = "default_color")]
    default_color: Color,
}

fn default_color() -> Color {
    DEFAULT_COLOR
}

/// Maps class ids to display names and colors.
///
/// The built-in table covers the 80 COCO classes in YOLO index order; a JSON
/// file of the same shape replaces it without code changes:
///
/// ```json
/// { "classes": [{ "id": 0, "name": "person", "color": [255, 56, 56] }],
///   "default_color": [255, 255, 255] }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct LabelRegistry {
    classes: BTreeMap<u32, ClassInfo>,
    default_color: Color,
}

impl LabelRegistry {
    pub fn new(classes: Vec<ClassInfo>, default_color: Color) -> Result<Self, LabelRegistryError> {
        let mut map = BTreeMap::new();
        for class in classes {
            let id = class.id;
            if map.insert(id, class).is_some() {
                return Err(LabelRegistryError::DuplicateId(id));
            }
        }
        Ok(Self {
            classes: map,
            default_color,
        })
    }

    pub fn coco() -> Self {
        let classes = COCO_CLASSES
            .iter()
            .enumerate()
            .map(|(i, name)| ClassInfo {
                id: i as u32,
                name: (*name).to_string(),
                color: palette_color(i),
            })
            .map(|c| (c.id, c))
            .collect();
        Self {
            classes,
            default_color: DEFAULT_COLOR,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, LabelRegistryError> {
        let file: LabelFile = serde_json::from_str(json)?;
        Self::new(file.classes, file.default_color)
    }

    pub fn from_file(path: &Path) -> Result<Self, LabelRegistryError> {
        let json = fs::read_to_string(path).map_err(|source| LabelRegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn lookup(&self, id: u32) -> LabelEntry<'_> {
        match self.classes.get(&id) {
            Some(class) => LabelEntry::Known {
                id,
                name: &class.name,
                color: class.color,
            },
            None => LabelEntry::Unknown {
                id,
                color: self.default_color,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for LabelRegistry {
    fn default() -> Self {
        Self::coco()
    }
}

const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

fn palette_color(i: usize) -> Color {
    Color(PALETTE[i % PALETTE.len()])
}

const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];
