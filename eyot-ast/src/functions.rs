#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use crate::ids::FunctionId;
use crate::types::Type;

/// The execution target attribute of a function or callable type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Locus {
    /// Needs the CPU (heap allocation, IO, workers).
    #[default]
    Cpu,
    /// Pure code that can run on either target.
    Anywhere,
    /// Needs the GPU (device builtins).
    Gpu,
}

impl Locus {
    /// Fixed bucket enumeration order; observable in generated symbol
    /// values, so it must never change.
    pub fn all() -> [Locus; 3] {
        [Locus::Cpu, Locus::Gpu, Locus::Anywhere]
    }

    fn index(self) -> usize {
        match self {
            Locus::Cpu => 0,
            Locus::Gpu => 1,
            Locus::Anywhere => 2,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Locus::Cpu => "c",
            Locus::Gpu => "g",
            Locus::Anywhere => "a",
        }
    }
}

impl fmt::Display for Locus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locus::Cpu => write!(f, "cpu"),
            Locus::Gpu => write!(f, "gpu"),
            Locus::Anywhere => write!(f, "anywhere"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FunctionSignature {
    pub locus: Locus,
    pub ret: Type,
    pub params: Vec<Type>,
}

impl FunctionSignature {
    /// Registry key: locus tag plus the raw identifiers of the return and
    /// parameter types. The locus is part of the identity so that a
    /// same-shape CPU/GPU pair is observable as two entries.
    pub fn map_key(&self) -> String {
        let mut key = String::new();
        key.push_str(self.locus.tag());
        key.push_str("__");
        key.push_str(&self.ret.raw_identifier());
        key.push_str("__");
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                key.push('_');
            }
            key.push_str(&ty.raw_identifier());
        }
        key
    }
}

/// Every function id declared with one signature, bucketed by locus.
#[derive(Clone, Debug)]
pub struct FunctionSet {
    pub signature: FunctionSignature,
    ids: [Vec<FunctionId>; 3],
}

impl FunctionSet {
    pub fn new(signature: FunctionSignature) -> Self {
        FunctionSet {
            signature,
            ids: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    pub fn ids_at(&self, locus: Locus) -> &[FunctionId] {
        &self.ids[locus.index()]
    }

    /// Struct functions arrive twice (once via the struct walk, once via
    /// the module walk); this deduplicates.
    fn add(&mut self, id: FunctionId, locus: Locus) {
        let bucket = &mut self.ids[locus.index()];
        if !bucket.contains(&id) {
            bucket.push(id);
        }
    }

    fn merge_in(&mut self, other: FunctionSet) {
        for locus in Locus::all() {
            for id in other.ids[locus.index()].iter() {
                self.add(id.clone(), locus);
            }
        }
    }
}

/// One declaration's place in the globally-stable enumeration shared by
/// the host and device translation units.
#[derive(Clone, Debug)]
pub struct FunctionEntry {
    /// The integer id; identical in both translation units. Closures
    /// packed on the host and unpacked on the device depend on this.
    pub id: usize,
    pub fid: FunctionId,
    pub locus: Locus,
}

/// Deduplicated registry of function signatures and their declarations.
///
/// The map is ordered so that id assignment is deterministic: entries are
/// enumerated in key order, then within a set in the fixed locus order,
/// then in insertion order.
#[derive(Clone, Debug, Default)]
pub struct FunctionGroup {
    sets: BTreeMap<String, FunctionSet>,
}

impl FunctionGroup {
    pub fn new() -> Self {
        FunctionGroup::default()
    }

    pub fn add(&mut self, id: FunctionId, signature: FunctionSignature, locus: Locus) {
        let key = signature.map_key();
        self.sets
            .entry(key)
            .or_insert_with(|| FunctionSet::new(signature))
            .add(id, locus);
    }

    pub fn merge_in(&mut self, other: FunctionGroup) {
        for (key, set) in other.sets {
            match self.sets.get_mut(&key) {
                Some(existing) => existing.merge_in(set),
                None => {
                    self.sets.insert(key, set);
                }
            }
        }
    }

    pub fn sets(&self) -> impl Iterator<Item = &FunctionSet> {
        self.sets.values()
    }

    /// Stable enumeration of every declaration with its integer id.
    pub fn entries(&self) -> Vec<FunctionEntry> {
        let mut entries = Vec::new();
        let mut running = 0usize;
        for set in self.sets.values() {
            for locus in Locus::all() {
                for fid in set.ids_at(locus) {
                    entries.push(FunctionEntry {
                        id: running,
                        fid: fid.clone(),
                        locus,
                    });
                    running += 1;
                }
            }
        }
        entries
    }

    /// The largest parameter count across every registered signature.
    pub fn max_arg_count(&self) -> usize {
        self.sets
            .values()
            .map(|s| s.signature.params.len())
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ModuleId;

    fn fid(name: &str) -> FunctionId {
        FunctionId::free(ModuleId::single("m"), name)
    }

    fn sig(locus: Locus, params: Vec<Type>) -> FunctionSignature {
        FunctionSignature {
            locus,
            ret: Type::Void,
            params,
        }
    }

    #[test]
    fn entry_ids_are_stable_across_enumerations() {
        let mut group = FunctionGroup::new();
        group.add(fid("b"), sig(Locus::Cpu, vec![Type::Integer]), Locus::Cpu);
        group.add(fid("a"), sig(Locus::Gpu, vec![Type::Integer]), Locus::Gpu);
        group.add(fid("c"), sig(Locus::Anywhere, vec![]), Locus::Anywhere);

        let first: Vec<_> = group.entries().iter().map(|e| (e.id, e.fid.clone())).collect();
        let second: Vec<_> = group.entries().iter().map(|e| (e.id, e.fid.clone())).collect();
        assert_eq!(first, second);

        let ids: Vec<usize> = group.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn add_deduplicates_repeat_declarations() {
        let mut group = FunctionGroup::new();
        group.add(fid("f"), sig(Locus::Cpu, vec![]), Locus::Cpu);
        group.add(fid("f"), sig(Locus::Cpu, vec![]), Locus::Cpu);
        assert_eq!(group.entries().len(), 1);
    }

    #[test]
    fn locus_is_part_of_the_signature_key() {
        let mut group = FunctionGroup::new();
        group.add(fid("f"), sig(Locus::Cpu, vec![Type::Integer]), Locus::Cpu);
        group.add(fid("f"), sig(Locus::Gpu, vec![Type::Integer]), Locus::Gpu);
        assert_eq!(group.sets().count(), 2);
    }

    #[test]
    fn max_arg_count_spans_all_signatures() {
        let mut group = FunctionGroup::new();
        group.add(fid("f"), sig(Locus::Cpu, vec![Type::Integer; 3]), Locus::Cpu);
        group.add(fid("g"), sig(Locus::Cpu, vec![]), Locus::Cpu);
        assert_eq!(group.max_arg_count(), 3);
    }
}
