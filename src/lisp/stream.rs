// KESTREL, a compact Lisp for small machines.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// KESTREL is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/lisp/stream.rs

// Byte transports behind stream descriptors. The runtime only knows
// "get one byte" and "put one byte"; collaborators register ports
// for each descriptor they serve.

// <>

use super::core::enum_and_tryfrom;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Bytes, Read, Write};
use std::path::Path;
use std::rc::Rc;

enum_and_tryfrom! {
    /// Transport kinds, in descriptor order
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Kind {
        Serial = 0,
        I2c = 1,
        Spi = 2,
        Sd = 3,
        Spiffs = 4,
        Wifi = 5,
    }
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Serial => "serial",
            Kind::I2c => "i2c",
            Kind::Spi => "spi",
            Kind::Sd => "sd",
            Kind::Spiffs => "spiffs",
            Kind::Wifi => "wifi",
        }
    }
}

/// Packs a transport kind and address into one descriptor
#[inline]
pub fn descriptor(kind: Kind, address: u8) -> u16 {
    (kind as u16) << 8 | address as u16
}

/// Splits a descriptor; unknown kinds yield None
pub fn split(desc: u16) -> Option<(Kind, u8)> {
    Kind::try_from((desc >> 8) as u8)
        .ok()
        .map(|k| (k, desc as u8))
}

/// The console is serial address zero
pub const CONSOLE: u16 = 0;

/// A byte transport
pub trait Port {
    /// Next byte, or None at end of stream
    fn get(&mut self) -> io::Result<Option<u8>>;

    fn put(&mut self, byte: u8) -> io::Result<()>;

    /// Called on entry to a resource scope; false means the device did
    /// not respond
    fn begin(&mut self) -> bool {
        true
    }

    /// Called on exit from a resource scope
    fn end(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Console on the process's standard streams
pub struct StdioPort {
    input: Bytes<io::Stdin>,
    output: io::Stdout,
}

impl StdioPort {
    pub fn new() -> Self {
        Self {
            input: io::stdin().bytes(),
            output: io::stdout(),
        }
    }
}

impl Default for StdioPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for StdioPort {
    fn get(&mut self) -> io::Result<Option<u8>> {
        // flush any pending prompt before blocking
        self.output.flush()?;
        self.input.next().transpose()
    }

    fn put(&mut self, byte: u8) -> io::Result<()> {
        self.output.write_all(&[byte])?;
        if byte == b'\n' {
            self.output.flush()?;
        }
        Ok(())
    }
}

/// Shared view of everything written to a buffer port
pub type Output = Rc<RefCell<Vec<u8>>>;

/// In-memory port with canned input and captured output
pub struct BufferPort {
    input: VecDeque<u8>,
    output: Output,
}

impl BufferPort {
    pub fn new(input: &[u8]) -> (Self, Output) {
        let output = Output::default();
        (
            Self {
                input: input.iter().copied().collect(),
                output: output.clone(),
            },
            output,
        )
    }
}

impl Port for BufferPort {
    fn get(&mut self) -> io::Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn put(&mut self, byte: u8) -> io::Result<()> {
        self.output.borrow_mut().push(byte);
        Ok(())
    }
}

/// How a storage file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Append,
    Write,
}

impl Mode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Mode::Append,
            2 => Mode::Write,
            _ => Mode::Read,
        }
    }
}

/// A host file standing in for block storage
pub enum FilePort {
    Reader(Bytes<BufReader<File>>),
    Writer(BufWriter<File>),
}

impl FilePort {
    pub fn open(path: &Path, mode: Mode) -> io::Result<Self> {
        log::debug!("opening {} as {:?}", path.display(), mode);

        Ok(match mode {
            Mode::Read => FilePort::Reader(BufReader::new(File::open(path)?).bytes()),
            Mode::Append => FilePort::Writer(BufWriter::new(
                OpenOptions::new().append(true).create(true).open(path)?,
            )),
            Mode::Write => FilePort::Writer(BufWriter::new(File::create(path)?)),
        })
    }
}

impl Port for FilePort {
    fn get(&mut self) -> io::Result<Option<u8>> {
        match self {
            FilePort::Reader(bytes) => bytes.next().transpose(),
            FilePort::Writer(_) => Ok(None),
        }
    }

    fn put(&mut self, byte: u8) -> io::Result<()> {
        match self {
            FilePort::Reader(_) => Ok(()),
            FilePort::Writer(w) => w.write_all(&[byte]),
        }
    }

    fn end(&mut self) -> io::Result<()> {
        log::debug!("closing storage file");
        match self {
            FilePort::Reader(_) => Ok(()),
            FilePort::Writer(w) => w.flush(),
        }
    }
}

/// Registry of ports by descriptor
///
/// Also holds one byte of pushback per descriptor for the reader, and
/// the last byte sent to the console for fresh-line handling.
pub struct Ports {
    ports: HashMap<u16, Box<dyn Port>>,
    pending: HashMap<u16, u8>,
    last_console: u8,
}

impl Ports {
    pub fn new(console: Box<dyn Port>) -> Self {
        let mut ports = HashMap::new();
        ports.insert(CONSOLE, console);

        Self {
            ports,
            pending: HashMap::new(),
            last_console: b'\n',
        }
    }

    /// Installs a port, returning whatever previously held the descriptor
    pub fn register(&mut self, desc: u16, port: Box<dyn Port>) -> Option<Box<dyn Port>> {
        log::debug!("registering port {:#06x}", desc);
        self.pending.remove(&desc);
        self.ports.insert(desc, port)
    }

    pub fn remove(&mut self, desc: u16) -> Option<Box<dyn Port>> {
        self.pending.remove(&desc);
        self.ports.remove(&desc)
    }

    pub fn contains(&self, desc: u16) -> bool {
        self.ports.contains_key(&desc)
    }

    pub fn port_mut(&mut self, desc: u16) -> Option<&mut (dyn Port + 'static)> {
        self.ports.get_mut(&desc).map(|p| p.as_mut())
    }

    fn missing(desc: u16) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no port for stream {:#06x}", desc),
        )
    }

    pub fn get(&mut self, desc: u16) -> io::Result<Option<u8>> {
        if let Some(b) = self.pending.remove(&desc) {
            return Ok(Some(b));
        }

        match self.ports.get_mut(&desc) {
            Some(port) => port.get(),
            None => Err(Self::missing(desc)),
        }
    }

    /// Pushes one byte back for the next get on the same descriptor
    pub fn unget(&mut self, desc: u16, byte: u8) {
        self.pending.insert(desc, byte);
    }

    pub fn put(&mut self, desc: u16, byte: u8) -> io::Result<()> {
        if desc == CONSOLE {
            self.last_console = byte;
        }

        match self.ports.get_mut(&desc) {
            Some(port) => port.put(byte),
            None => Err(Self::missing(desc)),
        }
    }

    pub fn write(&mut self, desc: u16, bytes: &[u8]) -> io::Result<()> {
        bytes.iter().try_for_each(|&b| self.put(desc, b))
    }

    /// Starts a new line unless the console is already at one
    pub fn fresh_line(&mut self) -> io::Result<()> {
        if self.last_console != b'\n' {
            self.put(CONSOLE, b'\n')?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors() {
        let d = descriptor(Kind::Sd, 1);
        assert_eq!(d, 0x0301);
        assert_eq!(split(d), Some((Kind::Sd, 1)));
        assert_eq!(split(descriptor(Kind::Serial, 0)), Some((Kind::Serial, 0)));
        assert_eq!(split(0x0900), None);
        assert_eq!(Kind::I2c.name(), "i2c");
    }

    #[test]
    fn buffers() {
        let (console, out) = BufferPort::new(b"ab");
        let mut ports = Ports::new(Box::new(console));

        assert_eq!(ports.get(CONSOLE).unwrap(), Some(b'a'));
        ports.unget(CONSOLE, b'a');
        assert_eq!(ports.get(CONSOLE).unwrap(), Some(b'a'));
        assert_eq!(ports.get(CONSOLE).unwrap(), Some(b'b'));
        assert_eq!(ports.get(CONSOLE).unwrap(), None);

        ports.fresh_line().unwrap();
        ports.write(CONSOLE, b"hi").unwrap();
        ports.fresh_line().unwrap();
        ports.fresh_line().unwrap();
        assert_eq!(&*out.borrow(), b"hi\n");

        assert!(ports.put(descriptor(Kind::Spi, 3), b'x').is_err());
    }

    #[test]
    fn files() {
        let path = std::env::temp_dir().join(format!("kestrel-port-{}.txt", std::process::id()));

        let mut w = FilePort::open(&path, Mode::Write).unwrap();
        b"one".iter().for_each(|&b| w.put(b).unwrap());
        w.end().unwrap();

        let mut a = FilePort::open(&path, Mode::Append).unwrap();
        a.put(b'!').unwrap();
        a.end().unwrap();

        let mut r = FilePort::open(&path, Mode::Read).unwrap();
        let mut text = Vec::new();
        while let Some(b) = r.get().unwrap() {
            text.push(b);
        }
        assert_eq!(text, b"one!");

        std::fs::remove_file(&path).unwrap();
    }
}
