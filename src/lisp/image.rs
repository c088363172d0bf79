// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/image.rs

// Persisted workspace images. The live heap is compacted and written
// as little-endian words: root form, size, global environment,
// protection stack, the long symbol table, then two words per cell.

// <>

use super::{
    core::{latin1, Cell, Obj, Tag},
    stdenv::Builtin,
    symtab::BUFFERSIZE,
    LispErr, Runtime,
};

use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Links are offset past every type tag
const LINK_BASE: u32 = 16;

fn link(obj: Obj) -> u32 {
    obj.index().map_or(0, |i| i as u32 + LINK_BASE)
}

fn unlink(word: u32) -> Obj {
    if word < LINK_BASE {
        Obj::NIL
    } else {
        Obj::from_index((word - LINK_BASE) as usize)
    }
}

/// Head and tail words of one cell
fn encode(cell: Cell) -> (u32, u32) {
    match cell {
        Cell::Pair { car, cdr } => (link(car), link(cdr)),
        Cell::Symbol(id) => (Tag::Symbol as u32, id),
        Cell::Int(i) => (Tag::Number as u32, i as u32),
        Cell::Stream(desc) => (Tag::Stream as u32, desc as u32),
        Cell::Char(c) => (Tag::Character as u32, c as u32),
        Cell::Float(f) => (Tag::Float as u32, f.to_bits()),
        Cell::Str { chars } => (Tag::String as u32, link(chars)),
        Cell::Chunk { next, packed } => (link(next), packed),
        Cell::Free { .. } => (0, 0),
    }
}

/// Cell for a word pair outside any string chain
fn decode(head: u32, tail: u32) -> Cell {
    if head >= LINK_BASE {
        return Cell::Pair {
            car: unlink(head),
            cdr: unlink(tail),
        };
    }

    match Tag::try_from(head as u8) {
        Ok(Tag::Symbol) => Cell::Symbol(tail),
        Ok(Tag::Number) => Cell::Int(tail as i32),
        Ok(Tag::Stream) => Cell::Stream(tail as u16),
        Ok(Tag::Character) => Cell::Char(tail as u8),
        Ok(Tag::Float) => Cell::Float(f32::from_bits(tail)),
        Ok(Tag::String) => Cell::Str {
            chars: unlink(tail),
        },
        _ => Cell::Pair {
            car: Obj::NIL,
            cdr: unlink(tail),
        },
    }
}

/// Decodes every cell, reinterpreting the members of string chains
fn decode_cells(words: &[(u32, u32)]) -> Vec<Cell> {
    let mut cells: Vec<Cell> = words.iter().map(|&(h, t)| decode(h, t)).collect();
    let mut chunk = vec![false; words.len()];

    for &(head, tail) in words {
        if head != Tag::String as u32 {
            continue;
        }

        let mut next = tail;
        while next >= LINK_BASE {
            let j = (next - LINK_BASE) as usize;
            if j >= words.len() || chunk[j] {
                break;
            }
            chunk[j] = true;
            cells[j] = Cell::Chunk {
                next: unlink(words[j].0),
                packed: words[j].1,
            };
            next = words[j].0;
        }
    }

    cells
}

fn write_word(out: &mut impl Write, word: u32) -> io::Result<()> {
    out.write_all(&word.to_le_bytes())
}

fn read_word(input: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

impl Runtime {
    fn image_file(&self, name: Obj) -> PathBuf {
        if name.is_nil() {
            self.config.image_path()
        } else {
            let file = latin1(&self.arena.string_bytes(name));
            self.config.storage.join(file)
        }
    }

    /// Writes the live heap to storage; returns the image size in cells
    ///
    /// A string argument names the file and leaves the root form empty.
    /// A list argument becomes the root form, run by autorun, and nil
    /// writes no root; both go to the default image.
    pub fn save_image(&mut self, arg: Obj) -> Result<usize, LispErr> {
        let (path, mut root) = if self.arena.stringp(arg) {
            (self.image_file(arg), Obj::NIL)
        } else if self.arena.listp(arg) {
            (self.config.image_path(), arg)
        } else {
            return Err(self.err_obj(Builtin::SaveImage, "illegal argument", arg));
        };

        // compacting a copy leaves handles held by running code intact
        let mut snapshot = self.arena.clone();
        let mut global_env = self.global_env;
        let mut gc_stack = self.gc_stack;
        let size = snapshot.compact(&mut [&mut root, &mut global_env, &mut gc_stack]);

        let file = File::create(&path).map_err(|e| {
            log::debug!("cannot create {}: {}", path.display(), e);
            self.err(Builtin::SaveImage, "problem saving image")
        })?;
        let mut out = BufWriter::new(file);

        write_word(&mut out, link(root))?;
        write_word(&mut out, size as u32)?;
        write_word(&mut out, link(global_env))?;
        write_word(&mut out, link(gc_stack))?;

        if self.symtab.size() > BUFFERSIZE {
            write_word(&mut out, self.symtab.top() as u32)?;
            out.write_all(self.symtab.bytes())?;
        }

        for &cell in &snapshot.cells()[..size] {
            let (head, tail) = encode(cell);
            write_word(&mut out, head)?;
            write_word(&mut out, tail)?;
        }
        out.flush()?;

        log::info!("saved image of {} cells to {}", size, path.display());
        Ok(size)
    }

    /// Replaces the heap with an image from storage; returns its size
    ///
    /// Nil loads the default image, a string names the file.
    pub fn load_image(&mut self, arg: Obj) -> Result<usize, LispErr> {
        if !arg.is_nil() && !self.arena.stringp(arg) {
            return Err(self.err_obj(Builtin::LoadImage, "illegal argument", arg));
        }

        let path = self.image_file(arg);
        let (size, _) = self.read_image(&path)?;
        Ok(size)
    }

    /// Loads an image file, returning its size and root form
    ///
    /// The whole file is read before the heap is touched, so a short or
    /// oversized image leaves the runtime as it was.
    fn read_image(&mut self, path: &Path) -> Result<(usize, Obj), LispErr> {
        let file = File::open(path).map_err(|e| {
            log::debug!("cannot open {}: {}", path.display(), e);
            self.err(Builtin::LoadImage, "problem loading image")
        })?;
        let mut input = BufReader::new(file);

        let root = unlink(read_word(&mut input)?);
        let size = read_word(&mut input)? as usize;
        if size > self.arena.capacity() {
            return Err(self.err(Builtin::LoadImage, "image too large"));
        }
        let global_env = unlink(read_word(&mut input)?);
        let gc_stack = unlink(read_word(&mut input)?);

        let table = if self.symtab.size() > BUFFERSIZE {
            let top = read_word(&mut input)? as usize;
            let mut bytes = vec![0; self.symtab.size()];
            input.read_exact(&mut bytes)?;
            Some((top, bytes))
        } else {
            None
        };

        let mut words = Vec::with_capacity(size);
        for _ in 0..size {
            let head = read_word(&mut input)?;
            let tail = read_word(&mut input)?;
            words.push((head, tail));
        }

        self.arena.restore(&decode_cells(&words))?;
        if let Some((top, bytes)) = table {
            self.symtab.restore(top, &bytes);
        }
        self.global_env = global_env;
        self.gc_stack = gc_stack;
        self.arena.collect(&[root, global_env, gc_stack]);
        self.tee = self.arena.symbol(Builtin::Tee.id())?;

        log::info!("loaded image of {} cells from {}", size, path.display());
        Ok((size, root))
    }

    /// Loads the default image and calls its root form with no arguments
    ///
    /// Returns the printed result, or None when there is no readable
    /// image or it was saved without a root form.
    pub fn autorun(&mut self) -> Result<Option<String>, LispErr> {
        let path = self.config.image_path();
        let root = File::open(&path).and_then(|f| read_word(&mut BufReader::new(f)));
        match root {
            Ok(0) => return Ok(None),
            Ok(_) => (),
            Err(e) => {
                log::warn!("autorun image {} unreadable: {}", path.display(), e);
                return Ok(None);
            }
        }

        let (_, root) = self.read_image(&path)?;
        // nothing is evaluating yet, so the saved protection stack is moot
        self.gc_stack = Obj::NIL;
        self.push_gc(root)?;

        log::info!("autorun from {}", path.display());
        match self.apply(Builtin::LoadImage.id(), root, Obj::NIL, Obj::NIL) {
            Ok(result) => {
                self.pop_gc();
                self.return_flag = false;
                Ok(Some(self.printed(result).to_string()))
            }
            Err(e) => {
                self.recover(Obj::NIL, 0);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{stream::BufferPort, Config};
    use super::*;

    use std::fs;

    fn storage(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kestrel-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime(config: Config) -> Runtime {
        let (console, _) = BufferPort::new(b"");
        Runtime::with_console(config, Box::new(console)).unwrap()
    }

    fn bare(dir: &Path) -> Runtime {
        runtime(Config {
            storage: dir.to_path_buf(),
            load_library: false,
            ..Config::default()
        })
    }

    #[test]
    fn cell_words() {
        let cells = [
            Cell::Pair {
                car: Obj::from_index(3),
                cdr: Obj::NIL,
            },
            Cell::Pair {
                car: Obj::NIL,
                cdr: Obj::from_index(0),
            },
            Cell::Symbol(64005),
            Cell::Int(-7),
            Cell::Stream(0x0302),
            Cell::Char(b'x'),
            Cell::Float(-1.5),
            Cell::Str {
                chars: Obj::from_index(9),
            },
        ];

        for cell in cells {
            let (head, tail) = encode(cell);
            assert_eq!(decode(head, tail), cell);
        }

        assert_eq!(encode(Cell::Int(1)), (4, 1));
        assert_eq!(encode(Cell::Pair { car: Obj::NIL, cdr: Obj::NIL }), (0, 0));
        assert_eq!(link(Obj::from_index(0)), 16);
    }

    #[test]
    fn string_chains() {
        // string at 0 with chunks at 2 and 1; the chunk at 1 ends the chain
        let words = [
            (Tag::String as u32, 18),
            (0, 0x6566_0000),
            (17, 0x6162_6364),
            (0, 5),
        ];
        let cells = decode_cells(&words);

        assert_eq!(cells[0], Cell::Str { chars: Obj::from_index(2) });
        assert_eq!(
            cells[2],
            Cell::Chunk {
                next: Obj::from_index(1),
                packed: 0x6162_6364
            }
        );
        assert_eq!(cells[1], Cell::Chunk { next: Obj::NIL, packed: 0x6566_0000 });
        assert_eq!(cells[3], Cell::Pair { car: Obj::NIL, cdr: Obj::NIL });
    }

    #[test]
    fn layout() {
        let dir = storage("layout");
        let mut rt = bare(&dir);

        let size: usize = rt.eval_str("(save-image \"layout.img\")").unwrap().parse().unwrap();
        let bytes = fs::read(dir.join("layout.img")).unwrap();
        let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);

        assert_eq!(word(0), 0);
        assert_eq!(word(1) as usize, size);
        assert_eq!(bytes.len(), 4 * 4 + 4 + 1024 + 8 * size);
    }

    #[test]
    fn round_trip() {
        let dir = storage("round-trip");

        let mut first = bare(&dir);
        first
            .eval_str(
                "(defvar data '(1 \"a longer string\" #\\3 4.5 longsymbolname (nested . pair)))
                 (defun sq (x) (* x x))",
            )
            .unwrap();
        let saved = first.eval_str("(save-image \"round.img\")").unwrap();

        let mut second = bare(&dir);
        assert_eq!(second.eval_str("(load-image \"round.img\")").unwrap(), saved);
        assert_eq!(
            second.eval_str("data").unwrap(),
            "(1 \"a longer string\" #\\3 4.5 longsymbolname (nested . pair))"
        );
        assert_eq!(second.eval_str("(sq 5)").unwrap(), "25");
        assert_eq!(second.eval_str("(eq (nth 4 data) 'longsymbolname)").unwrap(), "t");
        assert_eq!(second.eval_str("(eq t (= 1 1))").unwrap(), "t");
    }

    #[test]
    fn saving_leaves_running_code_intact() {
        let dir = storage("intact");
        let mut rt = bare(&dir);

        rt.eval_str("(defvar keep (list 1 2 3))").unwrap();
        let result = rt.eval_str("(list (save-image \"mid.img\") 'after keep)").unwrap();
        assert!(result.ends_with(" after (1 2 3))"));
        assert_eq!(rt.eval_str("keep").unwrap(), "(1 2 3)");
    }

    #[test]
    fn autorun() {
        let dir = storage("autorun");

        assert_eq!(bare(&dir).autorun().unwrap(), None);

        let mut first = bare(&dir);
        first
            .eval_str("(defun main () (* 6 7)) (save-image 'main)")
            .unwrap();
        assert_eq!(bare(&dir).autorun().unwrap(), Some("42".to_string()));

        // without a root form there is nothing to run
        first.eval_str("(save-image)").unwrap();
        assert_eq!(bare(&dir).autorun().unwrap(), None);
    }

    #[test]
    fn autorun_at_startup() {
        let dir = storage("startup");

        bare(&dir)
            .eval_str("(defun boot () (defvar booted 'yes)) (save-image 'boot)")
            .unwrap();

        let mut rt = runtime(Config {
            storage: dir.clone(),
            load_library: false,
            autorun: true,
            ..Config::default()
        });
        assert_eq!(rt.eval_str("booted").unwrap(), "yes");
    }

    #[test]
    fn failures() {
        let dir = storage("failures");

        let mut big = runtime(Config {
            storage: dir.clone(),
            ..Config::default()
        });
        big.eval_str("(save-image \"big.img\")").unwrap();

        let mut small = runtime(Config {
            workspace: 100,
            storage: dir.clone(),
            load_library: false,
            ..Config::default()
        });
        assert_eq!(
            small.eval_str("(load-image \"big.img\")").unwrap_err().to_string(),
            "'load-image' image too large"
        );
        assert_eq!(small.eval_str("(+ 1 2)").unwrap(), "3");

        let mut rt = bare(&dir);
        assert_eq!(
            rt.eval_str("(load-image \"missing.img\")").unwrap_err().to_string(),
            "'load-image' problem loading image"
        );
        assert_eq!(
            rt.eval_str("(save-image 5)").unwrap_err().to_string(),
            "'save-image' illegal argument: 5"
        );
        assert_eq!(
            rt.eval_str("(load-image 'x)").unwrap_err().to_string(),
            "'load-image' illegal argument: x"
        );

        fs::write(dir.join("short.img"), [0u8; 6]).unwrap();
        assert!(matches!(
            rt.eval_str("(load-image \"short.img\")"),
            Err(LispErr::Io(_))
        ));
    }
}
