//! Decoded method bodies and their memo cache.
//!
//! Decoding is a single linear scan that resolves labels to instruction
//! indices and pairs region markers: catch and fault handlers become skip
//! ranges, finally handlers are recorded with the try block they protect.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use symil_common::{BodySource, Instruction, LabelId, MethodBody, MethodId, Region};
use thiserror::Error;

/// Region markers that do not nest. `at` is the instruction index of the
/// offending marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("try end at {at} without a try start")]
    UnopenedTry { at: usize },
    #[error("finally at {at} does not follow a try block")]
    DetachedFinally { at: usize },
    #[error("handler end at {at} without a start")]
    UnopenedHandler { at: usize },
    #[error("mismatched handler end at {at}")]
    MismatchedHandler { at: usize },
    #[error("unterminated region starting at {at}")]
    Unterminated { at: usize },
}

/// A finally handler and the protected range it runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinallyRegion {
    /// Index of the `TryStart` marker.
    pub try_start: usize,
    /// Index of the `TryEnd` marker.
    pub try_end: usize,
    /// Index of the `FinallyStart` marker.
    pub start: usize,
    /// Index of the `FinallyEnd` marker.
    pub end: usize,
}

impl FinallyRegion {
    /// Whether `pc` lies inside the protected block.
    pub fn protects(&self, pc: usize) -> bool {
        self.try_start < pc && pc < self.try_end
    }
}

#[derive(Debug)]
pub struct DecodedBody {
    pub method: MethodId,
    pub body: Arc<MethodBody>,
    labels: FxHashMap<LabelId, usize>,
    /// Handler start marker -> first index after its end marker.
    skips: FxHashMap<usize, usize>,
    finally: Vec<FinallyRegion>,
}

impl DecodedBody {
    /// Decodes `body`, failing when region markers do not nest.
    pub fn decode(method: MethodId, body: Arc<MethodBody>) -> Result<Self, DecodeError> {
        let labels = body.label_positions();
        let mut skips = FxHashMap::default();
        let mut finally = Vec::new();
        let mut tries: Vec<usize> = Vec::new();
        let mut last_try: Option<(usize, usize)> = None;
        let mut handlers: Vec<(Region, usize, Option<(usize, usize)>)> = Vec::new();

        for (pc, instr) in body.instructions.iter().enumerate() {
            let Instruction::Region(region) = instr else {
                continue;
            };
            match region {
                Region::TryStart => tries.push(pc),
                Region::TryEnd => {
                    let start = tries
                        .pop()
                        .ok_or(DecodeError::UnopenedTry { at: pc })?;
                    last_try = Some((start, pc));
                }
                Region::CatchStart(_) | Region::FaultStart => handlers.push((*region, pc, None)),
                Region::FinallyStart => {
                    let protected = last_try
                        .take()
                        .ok_or(DecodeError::DetachedFinally { at: pc })?;
                    handlers.push((*region, pc, Some(protected)));
                }
                Region::CatchEnd | Region::FaultEnd | Region::FinallyEnd => {
                    let (open, start, protected) = handlers
                        .pop()
                        .ok_or(DecodeError::UnopenedHandler { at: pc })?;
                    let matches = matches!(
                        (open, region),
                        (Region::CatchStart(_), Region::CatchEnd)
                            | (Region::FaultStart, Region::FaultEnd)
                            | (Region::FinallyStart, Region::FinallyEnd)
                    );
                    if !matches {
                        return Err(DecodeError::MismatchedHandler { at: pc });
                    }
                    match protected {
                        Some((try_start, try_end)) => finally.push(FinallyRegion {
                            try_start,
                            try_end,
                            start,
                            end: pc,
                        }),
                        None => {
                            skips.insert(start, pc + 1);
                        }
                    }
                }
            }
        }
        if let Some(pc) = tries.last().copied().or(handlers.last().map(|h| h.1)) {
            return Err(DecodeError::Unterminated { at: pc });
        }
        Ok(Self {
            method,
            body,
            labels,
            skips,
            finally,
        })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.body.instructions
    }

    pub fn label(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Where execution resumes when it reaches a catch or fault handler.
    pub fn skip_handler(&self, pc: usize) -> Option<usize> {
        self.skips.get(&pc).copied()
    }

    /// Finally handlers a `leave` at `pc` towards `target` must run,
    /// innermost first.
    pub fn finally_for_leave(&self, pc: usize, target: usize) -> Vec<FinallyRegion> {
        let mut out: Vec<FinallyRegion> = self
            .finally
            .iter()
            .copied()
            .filter(|f| f.protects(pc) && !f.protects(target))
            .collect();
        out.sort_by_key(|f| std::cmp::Reverse(f.try_start));
        out
    }
}

/// Memoized decoding, shared by all executions of one engine.
#[derive(Debug, Default)]
pub struct DisassemblyCache {
    bodies: RwLock<FxHashMap<MethodId, Arc<DecodedBody>>>,
}

impl DisassemblyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decoded body of `method`; `Ok(None)` when the source has none.
    pub fn get(
        &self,
        source: &dyn BodySource,
        method: MethodId,
    ) -> Result<Option<Arc<DecodedBody>>, DecodeError> {
        if let Some(hit) = self.bodies.read().get(&method) {
            return Ok(Some(Arc::clone(hit)));
        }
        let Some(body) = source.body(method) else {
            return Ok(None);
        };
        let decoded = Arc::new(DecodedBody::decode(method, body)?);
        let mut bodies = self.bodies.write();
        let entry = bodies.entry(method).or_insert(decoded);
        Ok(Some(Arc::clone(entry)))
    }

    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.read().is_empty()
    }
}
