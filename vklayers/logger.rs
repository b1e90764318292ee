// vklayers
//
// Copyright 2023 Neil Roberts
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// on the rights to use, copy, modify, merge, publish, distribute, sub
// license, and/or sell copies of the Software, and to permit persons to whom
// the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice (including the next
// paragraph) shall be included in all copies or substantial portions of the
// Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT.  IN NO EVENT SHALL
// VA LINUX SYSTEM, IBM AND/OR THEIR SUPPLIERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR
// OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE
// USE OR OTHER DEALINGS IN THE SOFTWARE.

use std::fmt;
use std::io;
use std::str;

/// Where the complete lines collected by a [Logger] end up.
pub enum Sink<'a> {
    /// Forward each line to the [log] facade.
    Log {
        target: &'static str,
        level: log::Level,
    },
    /// Hand each line to a closure. The line never contains the
    /// trailing newline.
    Callback(&'a mut dyn FnMut(&str)),
}

impl<'a> fmt::Debug for Sink<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sink::Log { target, level } => f
                .debug_struct("Log")
                .field("target", target)
                .field("level", level)
                .finish(),
            Sink::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// A line-buffered writer used for the multi-line memory reports.
/// Text is collected until a complete line is available and then the
/// line is sent to the [Sink]. The struct implements both
/// [fmt::Write] and [io::Write] so it can be used with
/// [write!](std::write).
#[derive(Debug)]
pub struct Logger<'a> {
    sink: Sink<'a>,

    // The data is collected into this buffer until we have a complete
    // line to send to the sink.
    buf: Vec<u8>,

    // True if the any data was added from a u8 slice so it might not
    // be valid UTF-8.
    maybe_invalid_utf8: bool,
}

impl<'a> Logger<'a> {
    pub fn new(sink: Sink<'a>) -> Logger<'a> {
        Logger {
            sink,
            buf: Vec::new(),
            maybe_invalid_utf8: false,
        }
    }

    /// A logger that sends every line to [log::info!] with the given
    /// target.
    pub fn to_log(target: &'static str) -> Logger<'static> {
        Logger::new(Sink::Log { target, level: log::Level::Info })
    }

    fn send_range(&mut self, start: usize, end: usize) {
        if self.maybe_invalid_utf8 {
            let mut pos = start;

            while let Err(e) = str::from_utf8(&self.buf[pos..end]) {
                // Replace the offending byte with a question mark.
                // This keeps the line length the same.
                self.buf[pos + e.valid_up_to()] = b'?';
                pos += e.valid_up_to() + 1;
            }
        }

        let line = String::from_utf8_lossy(&self.buf[start..end]);

        match &mut self.sink {
            Sink::Log { target, level } => {
                log::log!(target: *target, *level, "{}", line);
            },
            Sink::Callback(callback) => (*callback)(&*line),
        }
    }

    fn flush_lines(&mut self) {
        let mut pos = 0;

        while let Some(line_len) = self.buf[pos..]
            .iter()
            .position(|&c| c == b'\n')
        {
            self.send_range(pos, pos + line_len);
            pos += line_len + 1;
        }

        // Remove the lines that we successfully processed
        self.buf.drain(0..pos);

        if self.buf.is_empty() {
            self.maybe_invalid_utf8 = false;
        }
    }
}

impl<'a> io::Write for Logger<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            self.maybe_invalid_utf8 = true;
            self.buf.extend_from_slice(buf);
            self.flush_lines();
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let len = self.buf.len();
            self.send_range(0, len);
            self.buf.clear();
            self.maybe_invalid_utf8 = false;
        }

        Ok(())
    }
}

impl<'a> fmt::Write for Logger<'a> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.extend_from_slice(s.as_bytes());
        self.flush_lines();
        Ok(())
    }
}

impl<'a> Drop for Logger<'a> {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn multiple_lines() {
        let mut items = Vec::new();
        let mut cb = |line: &str| items.push(line.to_string());

        {
            let mut logger = Logger::new(Sink::Callback(&mut cb));

            writeln!(
                &mut logger,
                "Device : fake\n  -----Heap 00-----\n  Total {}",
                1024,
            ).unwrap();
        }

        assert_eq!(items, ["Device : fake", "  -----Heap 00-----", "  Total 1024"]);
    }

    #[test]
    fn split_line() {
        let mut items = Vec::new();
        let mut cb = |line: &str| items.push(line.to_string());
        let mut logger = Logger::new(Sink::Callback(&mut cb));

        write!(&mut logger, "VkBuffer ").unwrap();
        write!(&mut logger, "{:16x}\nOffset 0\n", 0x42).unwrap();
        drop(logger);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0], "VkBuffer               42");
        assert_eq!(items[1], "Offset 0");
    }

    #[test]
    fn bad_utf8() {
        let mut items = Vec::new();
        let mut cb = |line: &str| items.push(line.to_string());
        let mut logger = Logger::new(Sink::Callback(&mut cb));

        io::Write::write(
            &mut logger,
            b"\xc4u ne mankas bajtoj \xc4\x89i tie \xe2\n",
        ).unwrap();
        drop(logger);

        assert_eq!(items, ["?u ne mankas bajtoj ĉi tie ?"]);
    }

    #[test]
    fn flush_on_drop() {
        let mut items = Vec::new();
        let mut cb = |line: &str| items.push(line.to_string());

        {
            let mut logger = Logger::new(Sink::Callback(&mut cb));
            write!(&mut logger, "One line\nUnterminated line").unwrap();
        }

        assert_eq!(items, ["One line", "Unterminated line"]);
    }

    #[test]
    fn log_sink() {
        // Nothing is listening but this shouldn’t panic
        let mut logger = Logger::to_log("memory_tracker");
        writeln!(&mut logger, "Device : fake").unwrap();
        assert!(logger.buf.is_empty());
    }
}
