use fxhash::FxHashMap;

use crate::addr::Address;

#[derive(Clone, Debug)]
pub struct Symbol {
    pub pass: u32,
    pub address: Address,
    pub public: bool,
}

#[derive(Debug)]
pub enum Define {
    Ok,
    /// Already defined in the current pass.
    Redefined,
}

/// Symbols persist across passes. Redefining one in a later pass with a
/// different address flags the change so the driver runs another pass;
/// redefining with the same address does not.
pub struct Symtab {
    inner: FxHashMap<u16, Symbol>,
    address_changed: bool,
}

impl Symtab {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: FxHashMap::default(),
            address_changed: false,
        }
    }

    pub fn define(&mut self, id: u16, pass: u32, address: Address) -> Define {
        match self.inner.get_mut(&id) {
            Some(sym) if sym.pass == pass => Define::Redefined,
            Some(sym) => {
                if sym.pass != 0 && sym.address != address {
                    self.address_changed = true;
                }
                sym.pass = pass;
                sym.address = address;
                Define::Ok
            }
            None => {
                self.inner.insert(
                    id,
                    Symbol {
                        pass,
                        address,
                        public: false,
                    },
                );
                Define::Ok
            }
        }
    }

    /// `PUBLIC` may precede the definition; the placeholder entry carries
    /// pass 0 so a real definition in any pass succeeds.
    pub fn mark_public(&mut self, id: u16) {
        self.inner
            .entry(id)
            .or_insert_with(|| Symbol {
                pass: 0,
                address: Address::undefined(),
                public: false,
            })
            .public = true;
    }

    /// The address a reference resolves to, if the symbol has ever been
    /// defined. Placeholder (public-only) entries are not definitions.
    #[inline]
    pub fn address(&self, id: u16) -> Option<Address> {
        self.inner
            .get(&id)
            .filter(|sym| sym.pass != 0)
            .map(|sym| sym.address)
    }

    #[inline]
    pub fn take_address_changed(&mut self) -> bool {
        let changed = self.address_changed;
        self.address_changed = false;
        changed
    }

    /// Public symbols sorted by id so object output is deterministic.
    pub fn publics(&self) -> Vec<(u16, Address)> {
        let mut publics: Vec<_> = self
            .inner
            .iter()
            .filter(|(_, sym)| sym.public)
            .map(|(&id, sym)| (id, sym.address))
            .collect();
        publics.sort_by_key(|&(id, _)| id);
        publics
    }
}

#[cfg(test)]
mod tests {
    use crate::addr::AddrKind;

    use super::*;

    #[test]
    fn same_pass_redefinition_is_an_error() {
        let mut symtab = Symtab::new();
        assert!(matches!(
            symtab.define(0x100, 1, Address::constant(1)),
            Define::Ok
        ));
        assert!(matches!(
            symtab.define(0x100, 1, Address::constant(1)),
            Define::Redefined
        ));
    }

    #[test]
    fn later_pass_change_sets_the_flag() {
        let mut symtab = Symtab::new();
        symtab.define(0x100, 1, Address::reloc(AddrKind::Code, 8));
        assert!(!symtab.take_address_changed());

        symtab.define(0x100, 2, Address::reloc(AddrKind::Code, 8));
        assert!(!symtab.take_address_changed());

        symtab.define(0x100, 3, Address::reloc(AddrKind::Code, 6));
        assert!(symtab.take_address_changed());
    }

    #[test]
    fn public_before_definition() {
        let mut symtab = Symtab::new();
        symtab.mark_public(0x100);
        assert_eq!(None, symtab.address(0x100));

        symtab.define(0x100, 1, Address::reloc(AddrKind::Code, 2));
        assert_eq!(2, symtab.address(0x100).unwrap().value);
        assert_eq!(vec![(0x100, Address::reloc(AddrKind::Code, 2))], symtab.publics());
    }
}
