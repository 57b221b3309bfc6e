// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt;

use super::GeneralRegisters;

/// The registers a guest changed between a VM entry and the following VM exit.
///
/// Formatting with `{:?}` lists only the changed registers, which keeps exit
/// traces short.
pub struct GeneralRegistersDiff {
    before: GeneralRegisters,
    after: GeneralRegisters,
}

impl GeneralRegistersDiff {
    pub fn new(before: GeneralRegisters, after: GeneralRegisters) -> Self {
        Self { before, after }
    }

    /// Returns `true` if the guest left every register untouched.
    pub fn is_same(&self) -> bool {
        self.before == self.after
    }

    /// Iterates over `(index, before, after)` for every changed register.
    pub fn changes(&self) -> impl Iterator<Item = (u8, u64, u64)> + '_ {
        (0..16u8)
            .filter(|&i| i != GeneralRegisters::RSP_INDEX)
            .map(|i| {
                (
                    i,
                    self.before.get_reg_of_index(i),
                    self.after.get_reg_of_index(i),
                )
            })
            .filter(|(_, before, after)| before != after)
    }
}

impl fmt::Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (i, before, after) in self.changes() {
            map.key(&GeneralRegisters::register_name(i))
                .value(&format_args!("{before:#x} -> {after:#x}"));
        }
        map.finish()
    }
}
