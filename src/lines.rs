//! Turns a message file into the sequence of bodies to publish.
//!
//! One body per line. Surrounding whitespace is trimmed and lines
//! that end up empty are skipped, so blank separators in the file
//! never turn into empty messages.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

pub struct MessageLines<R> {
    reader: R,
    buf: String,
}

impl MessageLines<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(MessageLines::new(BufReader::new(file)))
    }
}

impl<R: BufRead> MessageLines<R> {
    pub fn new(reader: R) -> Self {
        MessageLines {
            reader,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for MessageLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(Ok(line.to_string()));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MessageLines;
    use std::io::{Cursor, ErrorKind, Write};

    fn collect(input: &[u8]) -> Vec<String> {
        MessageLines::new(Cursor::new(input.to_vec()))
            .map(|line| line.unwrap())
            .collect()
    }

    #[test]
    fn test_trims_and_skips_blank_lines() {
        assert_eq!(collect(b"a\n\n  b  \nc"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_crlf_and_whitespace_only_lines() {
        assert_eq!(
            collect(b"{\"userId\":1}\r\n \t \r\n{\"userId\":2}\r\n"),
            vec!["{\"userId\":1}", "{\"userId\":2}"]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(collect(b"").is_empty());
        assert!(collect(b"\n\n   \n").is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_an_error() {
        let mut lines = MessageLines::new(Cursor::new(b"\xff\xfe\n".to_vec()));
        let err = lines.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_open_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  second").unwrap();

        let lines: Vec<String> = MessageLines::open(file.path())
            .unwrap()
            .map(|line| line.unwrap())
            .collect();
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MessageLines::open(dir.path().join("missing.txt")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
