use std::{
    fs::{self, File},
    io::{self, Read},
    path::Path,
};

use crate::intern::{PathInterner, PathRef};

pub trait FileSystem {
    type Reader: Read;

    fn is_dir(&self, path: &Path) -> io::Result<bool>;
    fn is_file(&self, path: &Path) -> io::Result<bool>;
    fn open_read(&self, path: &Path) -> io::Result<Self::Reader>;
}

pub struct RealFileSystem;

impl RealFileSystem {
    #[inline]
    pub fn new() -> Self {
        Self {}
    }
}

impl FileSystem for RealFileSystem {
    type Reader = File;

    #[inline]
    fn is_dir(&self, path: &Path) -> io::Result<bool> {
        Ok(fs::metadata(path)?.is_dir())
    }

    #[inline]
    fn is_file(&self, path: &Path) -> io::Result<bool> {
        Ok(fs::metadata(path)?.is_file())
    }

    #[inline]
    fn open_read(&self, path: &Path) -> io::Result<Self::Reader> {
        File::open(path)
    }
}

/// Opens source files and hands out interned path ids. Nested includes
/// resolve against the directory of the file that names them, then the
/// `-I` search paths.
pub struct FileManager<S> {
    file_system: S,
    path_interner: PathInterner,
    search_paths: Vec<PathRef>,
}

impl<S: FileSystem> FileManager<S> {
    #[inline]
    pub fn new(file_system: S) -> Self {
        Self {
            file_system,
            path_interner: PathInterner::new(),
            search_paths: Vec::new(),
        }
    }

    /// The file name shown in diagnostics.
    pub fn basename(&self, pathref: PathRef) -> &str {
        self.path_interner
            .get(pathref)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("?")
    }

    pub fn add_search_path<C: AsRef<Path>, P: AsRef<Path>>(
        &mut self,
        cwd: C,
        path: P,
    ) -> io::Result<PathRef> {
        self.file_system.is_dir(path.as_ref())?;
        let pathref = self.path_interner.intern(cwd, path);
        self.search_paths.push(pathref);
        Ok(pathref)
    }

    /// Open the top-level source file.
    pub fn open<C: AsRef<Path>, P: AsRef<Path>>(
        &mut self,
        cwd: C,
        path: P,
    ) -> io::Result<Option<(PathRef, S::Reader)>> {
        let pathref = self.path_interner.intern(cwd, path);
        let path = self.path_interner.get(pathref).unwrap().to_path_buf();
        if !self.file_system.is_file(&path).unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some((pathref, self.file_system.open_read(&path)?)))
    }

    /// Open a file named by an `INCLUDE` in the file `from`.
    pub fn open_include<P: AsRef<Path>>(
        &mut self,
        from: PathRef,
        path: P,
    ) -> io::Result<Option<(PathRef, S::Reader)>> {
        let mut dirs = Vec::with_capacity(self.search_paths.len() + 1);
        if let Some(parent) = self.path_interner.get(from).and_then(|p| p.parent()) {
            dirs.push(parent.to_path_buf());
        }
        for &dir in &self.search_paths {
            if let Some(dir) = self.path_interner.get(dir) {
                dirs.push(dir.to_path_buf());
            }
        }

        for dir in dirs {
            let full = dir.join(path.as_ref());
            if self.file_system.is_file(&full).unwrap_or(false) {
                let pathref = self.path_interner.intern(&dir, full);
                let path = self.path_interner.get(pathref).unwrap().to_path_buf();
                return Ok(Some((pathref, self.file_system.open_read(&path)?)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, path::PathBuf};

    use fxhash::FxHashMap;

    use super::*;

    struct FakeFileSystem {
        files: FxHashMap<PathBuf, String>,
    }

    impl FileSystem for FakeFileSystem {
        type Reader = Cursor<String>;

        fn is_dir(&self, _: &Path) -> io::Result<bool> {
            Ok(true)
        }

        fn is_file(&self, path: &Path) -> io::Result<bool> {
            Ok(self.files.contains_key(path))
        }

        fn open_read(&self, path: &Path) -> io::Result<Self::Reader> {
            Ok(Cursor::new(self.files.get(path).unwrap().clone()))
        }
    }

    fn file_manager(files: &[(&str, &str)]) -> FileManager<FakeFileSystem> {
        let mut map = FxHashMap::default();
        for (path, s) in files {
            map.insert(PathBuf::from(path), s.to_string());
        }
        FileManager::new(FakeFileSystem { files: map })
    }

    #[test]
    fn includes_resolve_against_the_including_file() {
        let mut fm = file_manager(&[("/src/main.z80", "a"), ("/src/sub/io.z80", "b")]);

        let (main, _) = fm.open("/", "src/main.z80").unwrap().unwrap();
        assert_eq!("main.z80", fm.basename(main));

        let (sub, _) = fm.open_include(main, "sub/io.z80").unwrap().unwrap();
        assert_eq!("io.z80", fm.basename(sub));
        assert!(fm.open_include(sub, "missing.z80").unwrap().is_none());
    }

    #[test]
    fn search_paths_are_tried_after_the_local_directory() {
        let mut fm = file_manager(&[("/src/main.z80", "a"), ("/lib/math.z80", "b")]);
        fm.add_search_path("/", "lib").unwrap();

        let (main, _) = fm.open("/", "src/main.z80").unwrap().unwrap();
        let (lib, _) = fm.open_include(main, "math.z80").unwrap().unwrap();
        assert_eq!("math.z80", fm.basename(lib));
    }
}
