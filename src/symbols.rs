//! Kernel symbol resolution.
//!
//! Resolves the routine name handed to `attach` into the address the probe
//! is armed on. The registry only sees symbols through [`SymbolResolver`].
//!
//! - [`KallsymsResolver`] (`symbols` feature): the kernel's own compressed
//!   symbol blob, mapped in place through `ksym`.
//! - [`SymbolTable`]: an owned table filled by hand or, with the `kallsyms`
//!   feature, from `/proc/kallsyms` text captured elsewhere.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

/// Error types for symbol operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input did not contain a single usable symbol.
    Empty,
    /// A line could not be parsed (1-based line number).
    InvalidLine(usize),
    /// Failed to parse the symbol table blob.
    ParseError(&'static str),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "Symbol table is empty"),
            Self::InvalidLine(n) => write!(f, "Malformed symbol line {}", n),
            Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
        }
    }
}

impl core::error::Error for Error {}

/// Name/address lookup used by the probe registry.
pub trait SymbolResolver: Send + Sync {
    /// Address of a probeable (text) symbol.
    fn lookup_addr(&self, name: &str) -> Option<u64>;

    /// Symbol containing `addr`, with the offset from its start.
    fn lookup_symbol(&self, addr: u64) -> Option<(String, u64)>;
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    addr: u64,
    ty: char,
}

impl SymbolEntry {
    fn is_text(&self) -> bool {
        matches!(self.ty, 't' | 'T')
    }
}

/// Owned kernel symbol table.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    by_name: BTreeMap<String, SymbolEntry>,
    by_addr: BTreeMap<u64, String>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one symbol. A later insert of the same name replaces the earlier one.
    pub fn insert(&mut self, name: &str, addr: u64, ty: char) -> &mut Self {
        if let Some(old) = self.by_name.insert(name.to_string(), SymbolEntry { addr, ty }) {
            self.by_addr.remove(&old.addr);
        }
        if addr != 0 {
            self.by_addr.insert(addr, name.to_string());
        }
        self
    }

    /// Parse `/proc/kallsyms` formatted text.
    ///
    /// Each line is `<hex addr> <type> <name> [module]`. Malformed lines are
    /// skipped; the parse fails only if nothing usable remains.
    #[cfg(feature = "kallsyms")]
    pub fn from_kallsyms(text: &str) -> Result<Self, Error> {
        let mut table = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Some((addr, ty, name)) => {
                    table.insert(name, addr, ty);
                }
                None => debug!("kallsyms: skipping {}", Error::InvalidLine(idx + 1)),
            }
        }

        if table.is_empty() {
            return Err(Error::Empty);
        }
        Ok(table)
    }

    /// Number of symbols in the table.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table holds no symbols.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Symbol type character (T, t, D, d, ...).
    pub fn symbol_type(&self, name: &str) -> Option<char> {
        self.by_name.get(name).map(|e| e.ty)
    }
}

#[cfg(feature = "kallsyms")]
fn parse_line(line: &str) -> Option<(u64, char, &str)> {
    let mut fields = line.split_whitespace();
    let addr = u64::from_str_radix(fields.next()?, 16).ok()?;
    let mut ty_field = fields.next()?.chars();
    let ty = ty_field.next()?;
    if ty_field.next().is_some() {
        return None;
    }
    let name = fields.next()?;
    Some((addr, ty, name))
}

impl SymbolResolver for SymbolTable {
    fn lookup_addr(&self, name: &str) -> Option<u64> {
        // Zeroed addresses come from kptr_restrict and cannot be probed.
        self.by_name
            .get(name)
            .filter(|e| e.is_text() && e.addr != 0)
            .map(|e| e.addr)
    }

    fn lookup_symbol(&self, addr: u64) -> Option<(String, u64)> {
        self.by_addr
            .range(..=addr)
            .next_back()
            .map(|(start, name)| (name.clone(), addr - start))
    }
}

#[cfg(feature = "symbols")]
const KSYM_NAME_LEN: usize = 1024;

/// Resolver over the kernel's compressed kallsyms blob.
#[cfg(feature = "symbols")]
pub struct KallsymsResolver {
    table: ksym::KallsymsMapped<'static>,
}

// SAFETY: the mapped table is never written after `from_blob`, and lookups
// only read it.
#[cfg(feature = "symbols")]
unsafe impl Send for KallsymsResolver {}
#[cfg(feature = "symbols")]
unsafe impl Sync for KallsymsResolver {}

#[cfg(feature = "symbols")]
impl KallsymsResolver {
    /// Map the symbol blob linked into the kernel image.
    ///
    /// `stext`/`etext` bound the kernel text section the blob describes.
    pub fn from_blob(data: &'static [u8], stext: u64, etext: u64) -> Result<Self, Error> {
        let table = ksym::KallsymsMapped::from_blob(data, stext, etext).map_err(Error::ParseError)?;
        info!("kallsyms: mapped {} bytes, text {:#x}-{:#x}", data.len(), stext, etext);
        Ok(Self { table })
    }
}

#[cfg(feature = "symbols")]
impl SymbolResolver for KallsymsResolver {
    fn lookup_addr(&self, name: &str) -> Option<u64> {
        let addr = self.table.lookup_name(name).filter(|&a| a != 0)?;
        // The blob also names data; only a symbol that starts a text
        // routine can carry a probe.
        let mut buf = [0u8; KSYM_NAME_LEN];
        match self.table.lookup_address(addr, &mut buf) {
            Some((_, _, 0, 't' | 'T')) => Some(addr),
            _ => None,
        }
    }

    fn lookup_symbol(&self, addr: u64) -> Option<(String, u64)> {
        let mut buf = [0u8; KSYM_NAME_LEN];
        self.table
            .lookup_address(addr, &mut buf)
            .map(|(name, _size, offset, _ty)| (String::from(name), offset))
    }
}

#[cfg(all(test, feature = "kallsyms"))]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff812a4b10 T handle_mm_fault
ffffffff812a5000 t __handle_mm_fault
ffffffff82600000 D init_mm
ffffffffc0a01000 t probe_init\t[demo_mod]
";

    #[test]
    fn errors_render_their_cause() {
        assert_eq!(Error::Empty.to_string(), "Symbol table is empty");
        assert_eq!(Error::InvalidLine(3).to_string(), "Malformed symbol line 3");
        assert_eq!(
            Error::ParseError("bad token table").to_string(),
            "Failed to parse symbol table: bad token table"
        );
    }

    #[test]
    fn parses_text_and_data_symbols() {
        let table = SymbolTable::from_kallsyms(SAMPLE).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.lookup_addr("handle_mm_fault"), Some(0xffff_ffff_812a_4b10));
        assert_eq!(table.lookup_addr("probe_init"), Some(0xffff_ffff_c0a0_1000));
        assert_eq!(table.symbol_type("init_mm"), Some('D'));
    }

    #[test]
    fn data_symbols_are_not_probe_targets() {
        let table = SymbolTable::from_kallsyms(SAMPLE).unwrap();
        assert_eq!(table.lookup_addr("init_mm"), None);
    }

    #[test]
    fn restricted_addresses_do_not_resolve() {
        let table = SymbolTable::from_kallsyms("0000000000000000 T handle_mm_fault\n").unwrap();
        assert_eq!(table.lookup_addr("handle_mm_fault"), None);
    }

    #[test]
    fn reverse_lookup_reports_offset() {
        let table = SymbolTable::from_kallsyms(SAMPLE).unwrap();
        let (name, off) = table.lookup_symbol(0xffff_ffff_812a_4b18).unwrap();
        assert_eq!(name, "handle_mm_fault");
        assert_eq!(off, 8);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "garbage\nffffffff812a4b10 T handle_mm_fault\n";
        let table = SymbolTable::from_kallsyms(text).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(SymbolTable::from_kallsyms("\n \n").unwrap_err(), Error::Empty);
        assert_eq!(SymbolTable::from_kallsyms("nonsense").unwrap_err(), Error::Empty);
    }
}
