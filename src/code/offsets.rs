use crate::errors::Error;
use log::trace;
use std::collections::HashMap;

/// Largest target offset a narrow `goto`/`jsr` is allowed to address.
///
/// The operand is a signed 16-bit relative offset. Comparing the absolute
/// target against this limit over-approximates (a short backward hop late in
/// a big method widens needlessly) but never under-approximates for forward
/// branches, and the encoder still range-checks the final relative offset.
const NARROW_TARGET_LIMIT: u32 = i16::MAX as u32;

/// Opaque position in a method body, bound to a final byte offset only once
/// [`OffsetsContext::normalize`] has run
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct Label(u32);

/// Positioned item recorded during the preprocessing walk.
///
/// Offsets stored here are provisional: they assume every branch keeps its
/// narrow form and every switch keeps its initial padding.
#[derive(Debug)]
enum Item {
    /// `goto`/`jsr` when `widenable`, a conditional branch otherwise
    Branch {
        at: u32,
        target: Label,
        wide: bool,
        widenable: bool,
    },
    /// Point a label is bound to
    Anchor { at: u32, label: Label },
    /// Alignment gap after a switch opcode, `pad` bytes in the provisional
    /// layout
    Padding { at: u32, pad: u8 },
}

/// Accumulates the method layout during preprocessing, then runs the
/// widening fixed point.
///
/// Branch operands, switch padding, and label offsets are mutually
/// dependent: widening one branch shifts everything after it, which can
/// change a later padding, which can push another target over the narrow
/// limit. [`OffsetsContext::normalize`] iterates until the layout is stable.
#[derive(Debug, Default)]
pub struct OffsetsContext {
    items: Vec<Item>,
    cursor: u32,
    next_label: u32,
}

impl OffsetsContext {
    pub fn new() -> OffsetsContext {
        OffsetsContext::default()
    }

    /// Provisional offset of the next instruction
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Move past an instruction of `size` bytes that needs no layout entry
    pub fn advance(&mut self, size: u32) {
        self.cursor += size;
    }

    /// Bind `label` to the current position
    pub fn record_label(&mut self, label: Label) {
        self.items.push(Item::Anchor {
            at: self.cursor,
            label,
        });
    }

    /// Bind a subroutine entry to the current position. Entries lay out
    /// exactly like labels; the distinction only matters to the caller.
    pub fn record_subroutine(&mut self, label: Label) {
        self.record_label(label);
    }

    /// Record a `goto`/`jsr`, provisionally narrow (3 bytes)
    pub fn record_jump(&mut self, target: Label) {
        self.items.push(Item::Branch {
            at: self.cursor,
            target,
            wide: false,
            widenable: true,
        });
        self.cursor += 3;
    }

    /// Record a conditional branch. Always 3 bytes: the instruction set has
    /// no wide conditionals, so an out-of-range target fails at encode time.
    pub fn record_conditional(&mut self, target: Label) {
        self.items.push(Item::Branch {
            at: self.cursor,
            target,
            wide: false,
            widenable: false,
        });
        self.cursor += 3;
    }

    /// Record the alignment gap after a switch opcode and return the
    /// provisional pad. The cursor is expected to sit right after the opcode
    /// byte.
    pub fn record_padding(&mut self) -> u8 {
        let pad = pad_at(self.cursor as i64);
        self.items.push(Item::Padding {
            at: self.cursor,
            pad,
        });
        self.cursor += pad as u32;
        pad
    }

    /// Run the widening fixed point and bind final offsets.
    ///
    /// Each pass walks the layout once, accumulating the byte shift that
    /// already-widened branches and re-sized paddings introduce, then widens
    /// every still-narrow `goto`/`jsr` whose target ended up past the narrow
    /// limit. The shift only ever grows by widening, so each branch widens
    /// at most once and the loop terminates.
    pub fn normalize(mut self) -> Result<ResolvedOffsets, Error> {
        let mut passes = 0;
        loop {
            passes += 1;
            let labels = self.current_labels();
            let mut changed = false;
            for item in self.items.iter_mut() {
                if let Item::Branch {
                    at,
                    target,
                    wide,
                    widenable: true,
                } = item
                {
                    if *wide {
                        continue;
                    }
                    let target_offset = labels
                        .get(target)
                        .copied()
                        .ok_or(Error::UnsupportedConstruct("branch to an unplaced label"))?;
                    if target_offset > NARROW_TARGET_LIMIT {
                        trace!(
                            "widening jump at provisional offset {} (target now at {})",
                            at,
                            target_offset
                        );
                        *wide = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                trace!("branch layout stable after {} pass(es)", passes);
                break;
            }
        }

        let labels = self.current_labels();
        let mut branches = Vec::new();
        let mut paddings = Vec::new();
        let mut shift: i64 = 0;
        for item in &self.items {
            let at = (*item_at(item) as i64 + shift) as u32;
            match item {
                Item::Branch {
                    target,
                    wide,
                    widenable,
                    ..
                } => {
                    branches.push(BranchSite {
                        at,
                        target: *target,
                        wide: *wide,
                        widenable: *widenable,
                    });
                    if *wide {
                        shift += 2;
                    }
                }
                Item::Anchor { .. } => (),
                Item::Padding { pad, .. } => {
                    let new_pad = pad_at(at as i64);
                    paddings.push(PaddingSite { at, pad: new_pad });
                    shift += new_pad as i64 - *pad as i64;
                }
            }
        }

        Ok(ResolvedOffsets {
            labels,
            branches,
            paddings,
            code_len: (self.cursor as i64 + shift) as u32,
        })
    }

    /// Label offsets under the current widening decisions
    fn current_labels(&self) -> HashMap<Label, u32> {
        let mut labels = HashMap::new();
        let mut shift: i64 = 0;
        for item in &self.items {
            let at = *item_at(item) as i64 + shift;
            match item {
                Item::Branch { wide: true, .. } => shift += 2,
                Item::Branch { .. } => (),
                Item::Anchor { label, .. } => {
                    labels.insert(*label, at as u32);
                }
                Item::Padding { pad, .. } => {
                    shift += pad_at(at) as i64 - *pad as i64;
                }
            }
        }
        labels
    }
}

fn item_at(item: &Item) -> &u32 {
    match item {
        Item::Branch { at, .. } | Item::Anchor { at, .. } | Item::Padding { at, .. } => at,
    }
}

/// Bytes of padding needed to 4-align the position right after `at`
fn pad_at(at: i64) -> u8 {
    ((4 - at % 4) % 4) as u8
}

/// One branch instruction with its final position and width
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BranchSite {
    pub at: u32,
    pub target: Label,
    pub wide: bool,
    pub widenable: bool,
}

/// One switch alignment gap with its final position and size
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PaddingSite {
    pub at: u32,
    pub pad: u8,
}

/// Final, stable layout of a method body
#[derive(Debug)]
pub struct ResolvedOffsets {
    labels: HashMap<Label, u32>,
    branches: Vec<BranchSite>,
    paddings: Vec<PaddingSite>,
    code_len: u32,
}

impl ResolvedOffsets {
    /// Total code length in bytes under the final layout
    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    /// Final absolute offset of a label
    pub fn offset_of(&self, label: Label) -> Result<u16, Error> {
        let offset = *self
            .labels
            .get(&label)
            .ok_or(Error::UnsupportedConstruct("reference to an unplaced label"))?;
        u16::try_from(offset).map_err(|_| Error::CodeSizeOverflow(offset))
    }

    /// Final absolute offset of a label, unbounded
    pub fn raw_offset_of(&self, label: Label) -> Result<u32, Error> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(Error::UnsupportedConstruct("reference to an unplaced label"))
    }

    pub fn branches(&self) -> &[BranchSite] {
        &self.branches
    }

    pub fn paddings(&self) -> &[PaddingSite] {
        &self.paddings
    }
}
