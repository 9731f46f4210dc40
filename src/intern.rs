use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use path_absolutize::Absolutize;

/// Interned name id. User identifiers and string literals start at
/// `FIRST_NAME_ID`; ids at `0x8000` and above are reserved for the
/// per-pass auto labels and are never interned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StrRef(pub u16);

pub const FIRST_NAME_ID: u16 = 0x100;

#[derive(Default, Debug)]
pub struct StrInterner {
    map: FxHashMap<String, StrRef>,
    names: Vec<String>,
}

impl StrInterner {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern<S: AsRef<str>>(&mut self, string: S) -> StrRef {
        let string = string.as_ref();
        if let Some(&strref) = self.map.get(string) {
            return strref;
        }
        let strref = StrRef(FIRST_NAME_ID + self.names.len() as u16);
        self.map.insert(string.to_string(), strref);
        self.names.push(string.to_string());
        strref
    }

    #[inline]
    pub fn get(&self, strref: StrRef) -> Option<&str> {
        self.names
            .get((strref.0 - FIRST_NAME_ID) as usize)
            .map(String::as_str)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PathRef(u32);

/// Paths are absolutized against the directory that referenced them
/// before interning, so one file reached through different include
/// chains gets one id.
#[derive(Default, Debug)]
pub struct PathInterner {
    map: FxHashMap<PathBuf, PathRef>,
    paths: Vec<PathBuf>,
}

impl PathInterner {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern<C: AsRef<Path>, P: AsRef<Path>>(&mut self, cwd: C, path: P) -> PathRef {
        let path = path
            .as_ref()
            .absolutize_from(cwd.as_ref())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| path.as_ref().to_path_buf());
        if let Some(&pathref) = self.map.get(&path) {
            return pathref;
        }
        let pathref = PathRef(self.paths.len() as u32);
        self.map.insert(path.clone(), pathref);
        self.paths.push(path);
        pathref
    }

    #[inline]
    pub fn get(&self, pathref: PathRef) -> Option<&Path> {
        self.paths.get(pathref.0 as usize).map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strs() {
        let mut int = StrInterner::new();
        let hello = int.intern("HELLO");

        assert_eq!("HELLO", int.get(hello).unwrap());

        let shoes = int.intern("SHOES");

        assert_eq!("HELLO", int.get(hello).unwrap());
        assert_eq!("SHOES", int.get(shoes).unwrap());
        assert_ne!(hello, shoes);
        assert_eq!(hello, int.intern("HELLO"));
    }

    #[test]
    fn ids_start_above_the_reserved_range() {
        let mut int = StrInterner::new();
        let first = int.intern("A");
        assert_eq!(FIRST_NAME_ID, first.0);
        assert!(first.0 < 0x8000);
    }

    #[test]
    fn abs_paths() {
        let mut int = PathInterner::new();
        let hello = int.intern("/foo", "./hello");

        let as_ref = AsRef::<Path>::as_ref;
        assert_eq!(as_ref("/foo/hello"), int.get(hello).unwrap());

        let shoes = int.intern("/foo", "../shoes");

        assert_eq!(as_ref("/foo/hello"), int.get(hello).unwrap());
        assert_eq!(as_ref("/shoes"), int.get(shoes).unwrap());

        assert_eq!(hello, int.intern("/foo", "hello"));
    }
}
