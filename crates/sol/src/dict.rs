//! The hyper-static dictionary forest.
//!
//! Every defined name lives in an arena (`Vec<DictEntry>`); a freshly
//! defined word is always prepended as the new head of its parent's
//! child list, which is what makes lookups hyper-static — a word can
//! never see a sibling defined *after* it.

use arkam_vm::Cell;

pub type EntryId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Quotation,
    Constant(Cell),
    /// Holds the storage cell's address, shared by a value's getter and
    /// setter entries.
    Value(Cell),
}

#[derive(Debug, Clone)]
pub struct DictEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Code address for `User`/`Quotation`/`Value`; the literal value for `Constant`.
    pub inst: Cell,
    pub parent: Option<EntryId>,
    pub child: Option<EntryId>,
    pub next: Option<EntryId>,
    pub level: u32,
    /// Back-patch site for a `Quotation`'s skip-jump. Unused by other kinds.
    pub back: Cell,
}

#[derive(Default)]
pub struct Dictionary {
    entries: Vec<DictEntry>,
    head: Option<EntryId>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntryId) -> &DictEntry {
        &self.entries[id]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut DictEntry {
        &mut self.entries[id]
    }

    /// Insert a new entry as the head of `parent`'s child list (or the
    /// top-level list when `parent` is `None`).
    pub fn define(&mut self, parent: Option<EntryId>, name: String, kind: EntryKind, inst: Cell) -> EntryId {
        let level = parent.map_or(0, |p| self.entries[p].level + 1);
        let next = match parent {
            Some(p) => self.entries[p].child.or(self.entries[p].next),
            None => self.head,
        };
        let id = self.entries.len();
        self.entries.push(DictEntry {
            name,
            kind,
            inst,
            parent,
            child: None,
            next,
            level,
            back: 0,
        });
        match parent {
            Some(p) => self.entries[p].child = Some(id),
            None => self.head = Some(id),
        }
        id
    }

    /// Unlink a Quotation entry from the forest once its closing `]` has
    /// been compiled — it is anonymous and never looked up again.
    pub fn free_quotation(&mut self, id: EntryId) {
        debug_assert_eq!(self.entries[id].kind, EntryKind::Quotation);
        let parent = self.entries[id].parent;
        let next = self.entries[id].next;
        match parent {
            Some(p) => self.entries[p].child = next,
            None => self.head = next,
        }
    }

    /// Resolve a (possibly `:`-qualified) name from the point of view of
    /// `current`, the definition presently open (`None` at top level).
    pub fn resolve(&self, current: Option<EntryId>, name: &str) -> Option<EntryId> {
        let segments: Vec<&str> = name.split(':').collect();
        let start = match current {
            Some(cur) => self.entries[cur].child.or(self.entries[cur].next),
            None => self.head,
        };
        self.resolve_from(start, 0, &segments)
    }

    fn resolve_from(&self, mut cursor: Option<EntryId>, level: u32, segments: &[&str]) -> Option<EntryId> {
        let name = segments[0];
        while let Some(id) = cursor {
            let w = &self.entries[id];
            if matches!(w.kind, EntryKind::Quotation) {
                cursor = w.next;
                continue;
            }
            if w.level < level {
                return None;
            }
            if w.name == name {
                if segments.len() == 1 {
                    return Some(id);
                }
                return self.resolve_from(w.child, level + 1, &segments[1..]);
            }
            cursor = w.next;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_sibling_is_invisible_to_earlier_one() {
        let mut d = Dictionary::new();
        let foo = d.define(None, "foo".into(), EntryKind::User, 100);
        // foo's own body is compiled against `current = Some(foo)`.
        assert!(d.resolve(Some(foo), "bar").is_none());
        let _bar = d.define(None, "bar".into(), EntryKind::User, 200);
        // once bar exists, a *new* definition can see it, but foo's
        // resolution context was captured before bar existed.
        assert!(d.resolve(None, "bar").is_some());
    }

    #[test]
    fn nested_definition_shadows_outer_name() {
        let mut d = Dictionary::new();
        let foo = d.define(None, "foo".into(), EntryKind::User, 1);
        let inner_foo = d.define(Some(foo), "foo".into(), EntryKind::User, 2);
        let bar = d.define(Some(foo), "bar".into(), EntryKind::User, 3);
        // bar, defined after inner foo within the same parent, should
        // resolve `foo` to the nested shadow, not the outer one.
        assert_eq!(d.resolve(Some(bar), "foo"), Some(inner_foo));
    }

    #[test]
    fn qualified_path_descends_into_child() {
        let mut d = Dictionary::new();
        let foo = d.define(None, "foo".into(), EntryKind::User, 1);
        let fbar = d.define(Some(foo), "bar".into(), EntryKind::User, 2);
        assert_eq!(d.resolve(None, "foo:bar"), Some(fbar));
    }

    #[test]
    fn quotations_are_invisible_to_name_lookup() {
        let mut d = Dictionary::new();
        let real = d.define(None, "word".into(), EntryKind::User, 20);
        let _q = d.define(None, String::new(), EntryKind::Quotation, 10);
        // the quotation is now the most recently defined entry; lookup
        // must walk past it to find `word`.
        assert_eq!(d.resolve(None, "word"), Some(real));
    }
}
