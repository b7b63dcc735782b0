// This module implements the packed calling convention shared by compiled methods and the
// calls they make. General (non-floating) arguments are counted in encounter order; the one
// that brings the count to the configured quota moves to the front of the argument list and
// packing stops there, which places it in the first general register. When a list has some
// general arguments but fewer than the quota, a zero machine word is put in front instead so
// the remaining general arguments keep their register positions. Floating arguments never
// count. Two-slot long/double parameters carry a Half marker in the optimizer's signature;
// those markers are dropped before packing. The same rule is applied to the function's
// parameter types, to every call's lowered argument values and, inverted, when mapping a
// parameter node to the physical argument that carries it.

//! Packed argument layout.

use crate::core::error::{CompileError, CompileResult};
use crate::graph::BasicType;
use crate::target::Type;

/// Reorder `items` into physical argument order.
///
/// `pad` produces the zero word inserted when `0 < general < quota`.
pub fn pack<T>(
    mut items: Vec<T>,
    is_float: impl Fn(&T) -> bool,
    quota: usize,
    pad: impl FnOnce() -> T,
) -> Vec<T> {
    let mut general = 0;
    for i in 0..items.len() {
        if is_float(&items[i]) {
            continue;
        }
        general += 1;
        if general == quota {
            let item = items.remove(i);
            items.insert(0, item);
            return items;
        }
    }
    if general != 0 {
        items.insert(0, pad());
    }
    items
}

/// Physical slot of one logical parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pad,
    Param(usize),
}

/// Parameter layout of a compiled method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    quota: usize,
    /// Target types in physical order.
    types: Vec<Type>,
    /// Physical position of each signature slot; `None` for `Half`.
    positions: Vec<Option<usize>>,
    padded: bool,
}

impl ParamLayout {
    /// Lay out `params` (including `Half` markers) with `type_of` giving
    /// the target type of each real parameter.
    pub fn new(
        params: &[BasicType],
        quota: usize,
        mut type_of: impl FnMut(BasicType) -> CompileResult<Type>,
    ) -> CompileResult<Self> {
        if quota == 0 {
            return Err(CompileError::InvalidConfig {
                reason: "general parameter quota must be at least 1".to_string(),
            });
        }
        let logical: Vec<Slot> = params
            .iter()
            .enumerate()
            .filter(|(_, ty)| **ty != BasicType::Half)
            .map(|(i, _)| Slot::Param(i))
            .collect();
        let physical = pack(
            logical,
            |slot| matches!(slot, Slot::Param(i) if params[*i].is_float()),
            quota,
            || Slot::Pad,
        );

        let mut types = Vec::with_capacity(physical.len());
        let mut positions = vec![None; params.len()];
        let mut padded = false;
        for (pos, slot) in physical.iter().enumerate() {
            match slot {
                Slot::Pad => {
                    padded = true;
                    types.push(Type::I64);
                }
                Slot::Param(i) => {
                    positions[*i] = Some(pos);
                    types.push(type_of(params[*i])?);
                }
            }
        }
        Ok(Self {
            quota,
            types,
            positions,
            padded,
        })
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// A zero word leads the argument list.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Physical argument carrying signature slot `param`.
    pub fn param_to_arg(&self, param: usize) -> Option<usize> {
        self.positions.get(param).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(bt: BasicType) -> CompileResult<Type> {
        Ok(match bt {
            BasicType::Float => Type::F32,
            BasicType::Double => Type::F64,
            BasicType::Long => Type::I64,
            _ => Type::I32,
        })
    }

    #[test]
    fn quota_reached_moves_last_general_to_front() {
        let packed = pack(vec![1, 2, 3, 4, 5, 6], |_| false, 4, || 0);
        assert_eq!(packed, vec![4, 1, 2, 3, 5, 6]);
    }

    #[test]
    fn short_lists_get_a_pad_word() {
        let packed = pack(vec![1, 2], |_| false, 4, || 0);
        assert_eq!(packed, vec![0, 1, 2]);
        let floats = pack(vec![-1, -2], |x| *x < 0, 4, || 0);
        assert_eq!(floats, vec![-1, -2]);
    }

    #[test]
    fn floats_are_skipped_when_counting() {
        let packed = pack(vec![1, -1, 2, 3], |x| *x < 0, 3, || 0);
        assert_eq!(packed, vec![3, 1, -1, 2]);
    }

    #[test]
    fn layout_drops_half_slots() {
        use BasicType::*;
        let layout = ParamLayout::new(&[Long, Half, Int, Double, Half], 6, ty).unwrap();
        assert!(layout.is_padded());
        assert_eq!(layout.types(), &[Type::I64, Type::I64, Type::I32, Type::F64]);
        assert_eq!(layout.param_to_arg(0), Some(1));
        assert_eq!(layout.param_to_arg(1), None);
        assert_eq!(layout.param_to_arg(2), Some(2));
        assert_eq!(layout.param_to_arg(3), Some(3));
    }
}
