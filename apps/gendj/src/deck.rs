//! The DJ deck: prompt slots, the built-in style library, the blend fader and
//! the active capture device. MIDI dispatch and manual controls both land
//! here; the deck answers with the side effect the caller should execute.

use crate::midi::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptPreset {
    pub label: &'static str,
    pub prompt: &'static str,
}

pub const DEFAULT_PROMPT: &str =
    "illustration of a dj sunglasses disco colors vibrant digital illustration HDR talking";

/// Built-in art style library.
pub const PROMPT_LIBRARY: &[PromptPreset] = &[
    PromptPreset {
        label: "DJ disco illustration",
        prompt: "a super cool dj wearing headphones, rose tinted aviator sunglasses, disco colors vibrant indoors digital illustration HDR talking",
    },
    PromptPreset {
        label: "Cyberpunk mechanical person",
        prompt: "an illustration of a cyborg, cyberpunk, futuristic, glowing eyes, hdr, ray tracing, bionic, metal skin, masterpiece, high resolution, computer generated",
    },
    PromptPreset {
        label: "Happy",
        prompt: "an illustration of a super happy very happy person smiling joyful joyous",
    },
    PromptPreset {
        label: "Sad",
        prompt: "an illustration of a sad super sad person tragic frowning saddest",
    },
    PromptPreset {
        label: "Old",
        prompt: "an illustration of an old grey hair person super old aged oldest",
    },
    PromptPreset {
        label: "Pixel art",
        prompt: "8-bit 8bit pixel art, retro gaming style, vibrant colors, low resolution, blocky shapes, blocky",
    },
    PromptPreset {
        label: "Pixel art medieval castle",
        prompt: "8-bit pixel art of a medieval castle with dragons, retro gaming style, vibrant colors, low resolution, blocky shapes",
    },
    PromptPreset {
        label: "Ocean waves",
        prompt: "a painting of waves, ocean waves, painted, brush strokes, painting, ocean, water, rich blue colors",
    },
    PromptPreset {
        label: "Vaporwave digital collage",
        prompt: "Vaporwave aesthetic digital collage, retro 80s and 90s symbols, pastel colors, glitch effects, geometric shapes",
    },
    PromptPreset {
        label: "Marble statue",
        prompt: "an illustration of a marble statue, person made of marble, stone, carved, white marble",
    },
    PromptPreset {
        label: "Art Nouveau mermaid",
        prompt: "Art Nouveau style illustration of a mermaid, flowing organic lines, pastel colors, intricate floral patterns, Alphonse Mucha inspired",
    },
    PromptPreset {
        label: "Low-poly candy world",
        prompt: "Isometric low-poly 3D render of a colorful candy world, pastel colors, geometric shapes, soft shadows, miniature scale",
    },
    PromptPreset {
        label: "Gothic charcoal haunted mansion",
        prompt: "Dark gothic charcoal sketch of a haunted Victorian mansion, high contrast, rough textures, eerie atmosphere, Tim Burton inspired",
    },
    PromptPreset {
        label: "Surrealist impossible architecture",
        prompt: "Surrealist digital painting of impossible architecture, M.C. Escher inspired, optical illusions, muted colors, dreamlike quality",
    },
    PromptPreset {
        label: "Anime magic",
        prompt: "an anime illustration of a magical character, soft pastel colors, dynamic pose, sparkles, magical, illustrated, anime, animated, drawn",
    },
    PromptPreset {
        label: "Doggy",
        prompt: "an illustration of a dog, dog, dog ears, whiskers, fur, colorful, doggy, puppy, dog face, a dog wearing glasses, fur, woof, barking, animal, canine, dog, illustrated dog, dog illustration",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSlot {
    One,
    Two,
}

/// Side effect the caller should carry out after a deck mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeckEffect {
    SubmitPrompt { slot: PromptSlot, text: String },
    SetBlend(f64),
    SwitchDevice(usize),
}

pub struct Deck {
    library: &'static [PromptPreset],
    selected: usize,
    slot_one: String,
    slot_two: String,
    post_text: String,
    blend: f64,
    device_count: usize,
    device_index: usize,
}

impl Deck {
    pub fn new(device_count: usize) -> Self {
        Self {
            library: PROMPT_LIBRARY,
            selected: 0,
            slot_one: DEFAULT_PROMPT.to_string(),
            slot_two: DEFAULT_PROMPT.to_string(),
            post_text: String::new(),
            blend: 0.0,
            device_count,
            device_index: 0,
        }
    }

    pub fn selected_preset(&self) -> Option<&PromptPreset> {
        self.library.get(self.selected)
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn blend(&self) -> f64 {
        self.blend
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn slot_text(&self, slot: PromptSlot) -> &str {
        match slot {
            PromptSlot::One => &self.slot_one,
            PromptSlot::Two => &self.slot_two,
        }
    }

    pub fn set_slot_text(&mut self, slot: PromptSlot, text: impl Into<String>) {
        match slot {
            PromptSlot::One => self.slot_one = text.into(),
            PromptSlot::Two => self.slot_two = text.into(),
        }
    }

    /// Free text appended to every submitted prompt.
    pub fn set_post_text(&mut self, text: impl Into<String>) {
        self.post_text = text.into();
    }

    /// Full text submitted for a slot: the slot prompt plus post text.
    pub fn submission_text(&self, slot: PromptSlot) -> String {
        let base = self.slot_text(slot);
        if self.post_text.is_empty() {
            base.to_string()
        } else {
            format!("{base} {}", self.post_text)
        }
    }

    /// Apply one dispatched action. Preconditions that do not hold (empty
    /// library, no devices) make the action a silent no-op.
    pub fn apply(&mut self, action: Action, value: u8) -> Option<DeckEffect> {
        match action {
            Action::Fader => {
                self.blend = f64::from(value) / 127.0;
                Some(DeckEffect::SetBlend(self.blend))
            }
            Action::LoadFirstPrompt => {
                self.load_selected(PromptSlot::One);
                None
            }
            Action::LoadSecondPrompt => {
                self.load_selected(PromptSlot::Two);
                None
            }
            Action::PromptSelectUp => {
                self.selected = self.selected.saturating_sub(1);
                None
            }
            Action::PromptSelectDown => {
                if !self.library.is_empty() {
                    self.selected = (self.selected + 1).min(self.library.len() - 1);
                }
                None
            }
            Action::PromptSubmit => Some(DeckEffect::SubmitPrompt {
                slot: PromptSlot::One,
                text: self.submission_text(PromptSlot::One),
            }),
            Action::SecondPromptSubmit => Some(DeckEffect::SubmitPrompt {
                slot: PromptSlot::Two,
                text: self.submission_text(PromptSlot::Two),
            }),
            Action::PreviousCamera => self.cycle_device(-1),
            Action::NextCamera => self.cycle_device(1),
        }
    }

    fn load_selected(&mut self, slot: PromptSlot) {
        if let Some(preset) = self.library.get(self.selected) {
            self.set_slot_text(slot, preset.prompt);
        }
    }

    fn cycle_device(&mut self, step: i64) -> Option<DeckEffect> {
        if self.device_count == 0 {
            return None;
        }
        let count = self.device_count as i64;
        let next = (self.device_index as i64 + step).rem_euclid(count) as usize;
        self.device_index = next;
        Some(DeckEffect::SwitchDevice(next))
    }
}
