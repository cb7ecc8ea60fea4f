//! Reading and writing call trees as folded stacks.
//!
//! A folded stack line holds a semicolon-separated list of frames, root first, followed by a
//! space and a sample count:
//!
//! ```text
//! main;foo;bar 12
//! ```

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use ahash::RandomState;
use indexmap::IndexSet;

use crate::call_tree::{CallTree, FrameId};

const READER_CAPACITY: usize = 128 * 1024;

/// Maps frame names to the [`FrameId`]s a [`CallTree`] stores.
#[derive(Clone, Debug, Default)]
pub struct FrameDict {
    names: IndexSet<String, RandomState>,
}

impl FrameDict {
    /// An empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// The id of `name`, assigning the next free one if it is new.
    pub fn intern(&mut self, name: &str) -> FrameId {
        if let Some(i) = self.names.get_index_of(name) {
            return i as FrameId;
        }
        self.names.insert_full(name.to_string()).0 as FrameId
    }

    /// The name behind `id`.
    pub fn name(&self, id: FrameId) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.names.get_index(i))
            .map(String::as_str)
    }

    /// Number of distinct frames.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no frame has been interned.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Configure how folded stacks are read.
///
/// All options default to off.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Strip hex numbers (addresses) of the form "0x45ef2173" and replace with "0x...".
    pub strip_hex: bool,
}

/// Adds the folded stacks in `reader` to `tree`, interning frames in `dict`.
///
/// Subtree weights of `tree` are up to date afterwards. Lines that do not parse are logged and
/// skipped; their number is returned.
pub fn from_reader<R>(
    opt: &Options,
    mut reader: R,
    dict: &mut FrameDict,
    tree: &mut CallTree,
) -> io::Result<usize>
where
    R: BufRead,
{
    let mut ignored = 0;
    let mut line = String::new();
    let mut stack = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line, opt.strip_hex) {
            Some((frames, count)) => {
                stack.clear();
                stack.extend(frames.split(';').map(|f| dict.intern(f)));
                stack.reverse();
                tree.insert(&stack, count);
            }
            None => {
                warn!("Unable to parse line: {}", line.trim_end());
                ignored += 1;
            }
        }
    }
    tree.propagate();
    Ok(ignored)
}

/// Like [`from_reader`], reading every file in turn.
pub fn from_files<P>(
    opt: &Options,
    filenames: &[P],
    dict: &mut FrameDict,
    tree: &mut CallTree,
) -> io::Result<usize>
where
    P: AsRef<Path>,
{
    let mut ignored = 0;
    for filename in filenames {
        let file = File::open(filename)?;
        let reader = io::BufReader::with_capacity(READER_CAPACITY, file);
        ignored += from_reader(opt, reader, dict, tree)?;
    }
    Ok(ignored)
}

/// Writes every stack of `tree` that has a self weight as a folded stack line, sorted by stack.
///
/// Frames missing from `dict` are written as their numeric id.
pub fn write<W>(tree: &CallTree, dict: &FrameDict, mut writer: W) -> io::Result<()>
where
    W: Write,
{
    let mut lines = Vec::new();
    tree.for_each_stack(|frames, weight| {
        let mut line = String::new();
        for (i, &id) in frames.iter().enumerate() {
            if i > 0 {
                line.push(';');
            }
            match dict.name(id) {
                Some(name) => line.push_str(name),
                None => line.push_str(itoa::Buffer::new().format(id)),
            }
        }
        lines.push((line, weight));
    });
    lines.sort_unstable();

    let mut buf = itoa::Buffer::new();
    for (stack, weight) in lines {
        writer.write_all(stack.as_bytes())?;
        writer.write_all(b" ")?;
        writer.write_all(buf.format(weight).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

// Parse stack and sample count from line.
fn parse_line(line: &str, strip_hex: bool) -> Option<(String, u64)> {
    let line = line.trim_end();
    let counti = line.rfind(' ')?;
    let count = line[(counti + 1)..].parse::<u64>().ok()?;
    let stack = line[..counti].trim_end();
    if stack.is_empty() {
        return None;
    }
    if strip_hex {
        return Some((strip_hex_address(stack), count));
    }
    Some((stack.to_string(), count))
}

// Replace all hex strings like "0x45ef2173" with "0x...".
fn strip_hex_address(stack: &str) -> String {
    let mut out = String::with_capacity(stack.len());
    let mut rest = stack;
    while let Some(idx) = rest.find("0x") {
        let ndigits = rest[idx + 2..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .count();
        out.push_str(&rest[..idx + 2]);
        if ndigits > 0 {
            out.push_str("...");
        }
        rest = &rest[idx + 2 + ndigits..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_off_the_count() {
        assert_eq!(
            parse_line("main;foo;bar 12\n", false),
            Some(("main;foo;bar".to_string(), 12))
        );
        assert_eq!(
            parse_line("main;foo bar 3", false),
            Some(("main;foo bar".to_string(), 3))
        );
        assert_eq!(parse_line("main;foo", false), None);
        assert_eq!(parse_line(" 3", false), None);
        assert_eq!(parse_line("main -1", false), None);
    }

    #[test]
    fn strip_hex_replaces_addresses() {
        assert_eq!(
            strip_hex_address("main;0x45ef2173;foo@0xdead"),
            "main;0x...;foo@0x..."
        );
        assert_eq!(strip_hex_address("0xzz;0x"), "0xzz;0x");
        assert_eq!(strip_hex_address("plain"), "plain");
    }

    #[test]
    fn builds_a_tree_and_writes_it_back() {
        let input = "main;foo;bar 3\nmain;foo 2\nnot a stack\n\nmain;baz 1\nmain;foo;bar 1\n";
        let mut dict = FrameDict::new();
        let mut tree = CallTree::new(0);
        let ignored = from_reader(&Options::default(), input.as_bytes(), &mut dict, &mut tree)
            .unwrap();
        assert_eq!(ignored, 1);
        assert_eq!(dict.len(), 4);
        assert_eq!(tree.total(), 7);
        assert_eq!(tree.weight(0), 7);

        let mut out = Vec::new();
        write(&tree, &dict, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "main;baz 1\nmain;foo 2\nmain;foo;bar 4\n"
        );
    }

    #[test]
    fn strip_hex_merges_stacks() {
        let input = "main;0x1234 1\nmain;0xabcd 2\n";
        let opt = Options { strip_hex: true };
        let mut dict = FrameDict::new();
        let mut tree = CallTree::new(0);
        from_reader(&opt, input.as_bytes(), &mut dict, &mut tree).unwrap();

        let mut out = Vec::new();
        write(&tree, &dict, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "main;0x... 3\n");
    }

    #[test]
    fn interning_is_stable() {
        let mut dict = FrameDict::new();
        assert!(dict.is_empty());
        let a = dict.intern("a");
        let b = dict.intern("b");
        assert_eq!(dict.intern("a"), a);
        assert_ne!(a, b);
        assert_eq!(dict.name(b), Some("b"));
        assert_eq!(dict.name(-1), None);
        assert_eq!(dict.name(7), None);
    }
}
