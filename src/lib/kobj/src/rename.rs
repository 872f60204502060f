use tracing::{debug, trace};

use crate::{ExemptionSet, KobjError, StringTable, StrtabCursor, SymbolEntry};

/// Rewrite the names of `symtab` so that every global, non-exempt symbol is prefixed with
/// `prefix`, producing a tightly packed replacement for `strtab`.
///
/// Names are resolved once up front to size the working buffer; symbols may share a name or a
/// tail of one, and each gets its own copy in the new table. New name offsets are staged and only
/// written into `symtab`, and the new table only replaces `*strtab`, once the exact-size table has
/// been built. On error both are left exactly as they were.
///
/// Renaming is not idempotent unless `exemptions` contains `prefix`; see
/// [ExemptionSet::with_prefix_exempt].
pub fn renamespace(
    symtab: &mut [SymbolEntry],
    strtab: &mut StringTable,
    prefix: &str,
    exemptions: &ExemptionSet,
) -> Result<(), KobjError> {
    let prefix = prefix.as_bytes();
    let renames = |sym: &SymbolEntry, name: &[u8]| sym.is_global() && !exemptions.matches(name);

    // Room for the leading empty name, which symbols with no name point at.
    let mut size = 1usize;
    for sym in symtab.iter().filter(|s| s.name != 0) {
        let name = strtab.get(sym.name as usize)?;
        if name.is_empty() {
            continue;
        }
        let extra = if renames(sym, name) { prefix.len() } else { 0 };
        size = size
            .checked_add(name.len() + 1 + extra)
            .ok_or(KobjError::Allocation { size: usize::MAX })?;
    }

    let mut cursor = StrtabCursor::with_capacity(size)?;
    let empty = cursor.push(&[])?;
    debug_assert_eq!(empty, 0);

    let mut staged = Vec::new();
    staged
        .try_reserve_exact(symtab.len())
        .map_err(|_| KobjError::Allocation {
            size: symtab.len() * std::mem::size_of::<u32>(),
        })?;

    let mut renamed = 0usize;
    for sym in symtab.iter() {
        if sym.name == 0 {
            staged.push(0);
            continue;
        }
        let name = strtab.get(sym.name as usize)?;
        if name.is_empty() {
            staged.push(0);
            continue;
        }

        let offset = if !renames(sym, name) {
            cursor.push(&[name])?
        } else {
            trace!(
                "renaming {} -> {}{}",
                String::from_utf8_lossy(name),
                String::from_utf8_lossy(prefix),
                String::from_utf8_lossy(name)
            );
            renamed += 1;
            cursor.push(&[prefix, name])?
        };
        staged.push(offset);
    }

    let new_table = cursor.finish()?;
    debug!(
        "renamespace: {} symbols, {} renamed, string table {} -> {} bytes",
        symtab.len(),
        renamed,
        strtab.len(),
        new_table.len()
    );

    for (sym, offset) in symtab.iter_mut().zip(staged) {
        sym.name = offset;
    }
    *strtab = new_table;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Binding;

    /// Build a table and entries from (name, binding) pairs. An empty name maps to offset 0.
    fn table(syms: &[(&str, Binding)]) -> (Vec<SymbolEntry>, StringTable) {
        let mut bytes = vec![0u8];
        let mut entries = Vec::new();
        for (name, binding) in syms {
            if name.is_empty() {
                entries.push(SymbolEntry::new(0, *binding));
                continue;
            }
            entries.push(SymbolEntry::new(bytes.len() as u32, *binding));
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }
        (entries, StringTable::new(bytes))
    }

    fn names(entries: &[SymbolEntry], strtab: &StringTable) -> Vec<String> {
        entries
            .iter()
            .map(|e| strtab.get_str(e.name as usize).unwrap())
            .collect()
    }

    #[test]
    fn global_and_local() {
        let (mut syms, mut strtab) = table(&[("foo", Binding::Global), ("bar", Binding::Local)]);
        renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap();
        assert_eq!(names(&syms, &strtab), vec!["ns_foo", "bar"]);
    }

    #[test]
    fn offset_points_at_prefix() {
        let (mut syms, mut strtab) = table(&[("foo", Binding::Global)]);
        renamespace(&mut syms, &mut strtab, "rumpns_", &ExemptionSet::new()).unwrap();
        let off = syms[0].name as usize;
        assert_eq!(&strtab.as_bytes()[off..off + 7], b"rumpns_");
        assert_eq!(strtab.get(off).unwrap(), b"rumpns_foo");
    }

    #[test]
    fn exempt_and_other_bindings_unchanged() {
        let (mut syms, mut strtab) = table(&[
            ("__start_set", Binding::Global),
            ("weakling", Binding::Other(elf::abi::STB_WEAK)),
            ("local", Binding::Local),
            ("plain", Binding::Global),
        ]);
        let before = names(&syms, &strtab);
        let exempt = ExemptionSet::from_list("__");
        renamespace(&mut syms, &mut strtab, "ns_", &exempt).unwrap();
        let after = names(&syms, &strtab);
        assert_eq!(&after[..3], &before[..3]);
        assert_eq!(after[3], "ns_plain");
    }

    #[test]
    fn empty_names_stay_at_zero() {
        let (mut syms, mut strtab) = table(&[("", Binding::Local), ("x", Binding::Global)]);
        renamespace(&mut syms, &mut strtab, "p_", &ExemptionSet::new()).unwrap();
        assert_eq!(syms[0].name, 0);
        assert_eq!(strtab.get(0).unwrap(), b"");
        assert_eq!(names(&syms, &strtab)[1], "p_x");
    }

    #[test]
    fn tight_packing() {
        let (mut syms, mut strtab) = table(&[
            ("", Binding::Local),
            ("alpha", Binding::Global),
            ("beta", Binding::Local),
            ("gamma", Binding::Global),
        ]);
        renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap();
        let emitted: usize = names(&syms, &strtab)
            .iter()
            .filter(|n| !n.is_empty())
            .map(|n| n.len() + 1)
            .sum();
        // The leading empty name accounts for the one extra byte.
        assert_eq!(strtab.len(), emitted + 1);

        let mut spans: Vec<_> = syms
            .iter()
            .filter(|s| s.name != 0)
            .map(|s| {
                let len = strtab.get(s.name as usize).unwrap().len();
                (s.name as usize, s.name as usize + len + 1)
            })
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "gap or overlap between names");
        }
        assert_eq!(spans.last().unwrap().1, strtab.len());
    }

    #[test]
    fn rerun_double_prefixes_without_exemption() {
        let (mut syms, mut strtab) = table(&[("foo", Binding::Global)]);
        renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap();
        renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap();
        assert_eq!(names(&syms, &strtab), vec!["ns_ns_foo"]);

        let (mut syms, mut strtab) = table(&[("foo", Binding::Global)]);
        let exempt = ExemptionSet::new().with_prefix_exempt("ns_");
        renamespace(&mut syms, &mut strtab, "ns_", &exempt).unwrap();
        renamespace(&mut syms, &mut strtab, "ns_", &exempt).unwrap();
        assert_eq!(names(&syms, &strtab), vec!["ns_foo"]);
    }

    #[test]
    fn failure_leaves_input_untouched() {
        let (mut syms, mut strtab) = table(&[("ok", Binding::Global)]);
        syms.push(SymbolEntry::new(500, Binding::Global));
        let syms_before = syms.clone();
        let strtab_before = strtab.clone();
        let err = renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap_err();
        assert!(matches!(err, KobjError::BadStringOffset { offset: 500, .. }));
        assert_eq!(syms, syms_before);
        assert_eq!(strtab, strtab_before);
    }

    #[test]
    fn shared_suffix_offsets() {
        // Names in real tables may overlap (suffix sharing); each gets its own copy.
        let mut strtab = StringTable::new(b"\0xfoo\0".to_vec());
        let mut syms = vec![
            SymbolEntry::new(1, Binding::Global),
            SymbolEntry::new(2, Binding::Local),
        ];
        renamespace(&mut syms, &mut strtab, "n_", &ExemptionSet::new()).unwrap();
        assert_eq!(names(&syms, &strtab), vec!["n_xfoo", "foo"]);
        assert_eq!(strtab.len(), 1 + 7 + 4);
    }

    #[test]
    fn symbols_sharing_one_name() {
        let mut strtab = StringTable::new(b"\0longname\0".to_vec());
        let mut syms = vec![
            SymbolEntry::new(1, Binding::Local),
            SymbolEntry::new(1, Binding::Local),
            SymbolEntry::new(1, Binding::Global),
        ];
        renamespace(&mut syms, &mut strtab, "ns_", &ExemptionSet::new()).unwrap();
        assert_eq!(names(&syms, &strtab), vec!["longname", "longname", "ns_longname"]);
        assert_ne!(syms[0].name, syms[1].name);
        assert_eq!(strtab.len(), 1 + 9 + 9 + 12);
    }
}
