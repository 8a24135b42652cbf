use std::time::Instant;

/// Screen geometry every board in this era assumes.
pub const COLS: usize = 80;
pub const ROWS: usize = 24;

#[derive(Debug, Clone, PartialEq)]
enum ParseState {
    Ground,
    Escape,
    EscapeCharset,
    Csi(String),
}

/// An 80x24 virtual screen. Bytes decoded from the wire are written here and
/// the agent only ever sees the rendered grid, never the raw stream.
///
/// Color and attribute sequences are accepted and discarded; the model reads
/// plain text.
#[derive(Debug)]
pub struct VirtualTerminal {
    grid: Vec<Vec<char>>,
    row: usize,
    col: usize,
    saved: (usize, usize),
    state: ParseState,
    last_write: Instant,
}

impl VirtualTerminal {
    pub fn new() -> Self {
        VirtualTerminal {
            grid: vec![vec![' '; COLS]; ROWS],
            row: 0,
            col: 0,
            saved: (0, 0),
            state: ParseState::Ground,
            last_write: Instant::now(),
        }
    }

    /// Apply a chunk of decoded text to the screen. Escape sequences may be
    /// split across chunks; the parser keeps its state between calls.
    pub fn write(&mut self, text: &str) {
        for ch in text.chars() {
            self.step(ch);
        }
        self.last_write = Instant::now();
    }

    fn step(&mut self, ch: char) {
        match std::mem::replace(&mut self.state, ParseState::Ground) {
            ParseState::Ground => self.step_ground(ch),
            ParseState::Escape => self.step_escape(ch),
            ParseState::EscapeCharset => {} // charset designator, one char, ignored
            ParseState::Csi(mut params) => {
                if ('\x40'..='\x7e').contains(&ch) {
                    self.dispatch_csi(&params, ch);
                } else if params.len() < 64 {
                    params.push(ch);
                    self.state = ParseState::Csi(params);
                }
                // overlong sequences are dropped back to ground
            }
        }
    }

    fn step_ground(&mut self, ch: char) {
        match ch {
            '\x1b' => self.state = ParseState::Escape,
            '\r' => self.col = 0,
            '\n' => self.line_feed(),
            '\x08' => self.col = self.col.saturating_sub(1),
            '\t' => {
                let next = ((self.col / 8) + 1) * 8;
                self.col = next.min(COLS - 1);
            }
            '\x07' | '\x00' => {}
            c if (c as u32) < 0x20 => {}
            c => {
                if self.col >= COLS {
                    self.col = 0;
                    self.line_feed();
                }
                self.grid[self.row][self.col] = c;
                self.col += 1;
            }
        }
    }

    fn step_escape(&mut self, ch: char) {
        match ch {
            '[' => self.state = ParseState::Csi(String::new()),
            '(' | ')' => self.state = ParseState::EscapeCharset,
            'c' => self.reset(),
            'D' => self.line_feed(),
            'M' => self.reverse_line_feed(),
            '7' => self.saved = (self.row, self.col),
            '8' => {
                let (r, c) = self.saved;
                self.row = r.min(ROWS - 1);
                self.col = c.min(COLS - 1);
            }
            _ => {}
        }
    }

    fn dispatch_csi(&mut self, params: &str, final_byte: char) {
        let args: Vec<usize> = params
            .split(';')
            .map(|p| p.trim_start_matches('?').parse::<usize>().unwrap_or(0))
            .collect();
        let arg = |i: usize, default: usize| -> usize {
            match args.get(i) {
                Some(&0) | None => default,
                Some(&v) => v,
            }
        };

        match final_byte {
            'H' | 'f' => {
                self.row = (arg(0, 1) - 1).min(ROWS - 1);
                self.col = (arg(1, 1) - 1).min(COLS - 1);
            }
            'A' => self.row = self.row.saturating_sub(arg(0, 1)),
            'B' => self.row = (self.row + arg(0, 1)).min(ROWS - 1),
            'C' => self.col = (self.col + arg(0, 1)).min(COLS - 1),
            'D' => self.col = self.col.saturating_sub(arg(0, 1)),
            'G' => self.col = (arg(0, 1) - 1).min(COLS - 1),
            'd' => self.row = (arg(0, 1) - 1).min(ROWS - 1),
            'J' => self.erase_display(args.first().copied().unwrap_or(0)),
            'K' => self.erase_line(args.first().copied().unwrap_or(0)),
            'S' => {
                for _ in 0..arg(0, 1) {
                    self.scroll_up();
                }
            }
            'T' => {
                for _ in 0..arg(0, 1) {
                    self.scroll_down();
                }
            }
            's' => self.saved = (self.row, self.col),
            'u' => {
                let (r, c) = self.saved;
                self.row = r.min(ROWS - 1);
                self.col = c.min(COLS - 1);
            }
            // SGR and mode toggles carry no text
            'm' | 'h' | 'l' | 'n' | 'r' | 't' => {}
            _ => {}
        }
    }

    fn line_feed(&mut self) {
        if self.row + 1 >= ROWS {
            self.scroll_up();
        } else {
            self.row += 1;
        }
    }

    fn reverse_line_feed(&mut self) {
        if self.row == 0 {
            self.scroll_down();
        } else {
            self.row -= 1;
        }
    }

    fn scroll_up(&mut self) {
        self.grid.remove(0);
        self.grid.push(vec![' '; COLS]);
    }

    fn scroll_down(&mut self) {
        self.grid.pop();
        self.grid.insert(0, vec![' '; COLS]);
    }

    fn erase_display(&mut self, mode: usize) {
        match mode {
            0 => {
                self.erase_line(0);
                for r in (self.row + 1)..ROWS {
                    self.grid[r] = vec![' '; COLS];
                }
            }
            1 => {
                self.erase_line(1);
                for r in 0..self.row {
                    self.grid[r] = vec![' '; COLS];
                }
            }
            _ => {
                for r in 0..ROWS {
                    self.grid[r] = vec![' '; COLS];
                }
                self.row = 0;
                self.col = 0;
            }
        }
    }

    fn erase_line(&mut self, mode: usize) {
        let (from, to) = match mode {
            0 => (self.col, COLS),
            1 => (0, (self.col + 1).min(COLS)),
            _ => (0, COLS),
        };
        for c in from..to {
            self.grid[self.row][c] = ' ';
        }
    }

    /// Render the grid as text: trailing whitespace trimmed per line,
    /// trailing blank lines removed. Pure with respect to grid state.
    pub fn snapshot(&self) -> String {
        let mut lines: Vec<String> = self
            .grid
            .iter()
            .map(|row| row.iter().collect::<String>().trim_end().to_string())
            .collect();
        while lines.last().map_or(false, |l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }

    /// The last n non-blank lines of the current snapshot.
    pub fn tail(&self, n: usize) -> String {
        let snapshot = self.snapshot();
        let lines: Vec<&str> = snapshot.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn last_write(&self) -> Instant {
        self.last_write
    }

    pub fn reset(&mut self) {
        self.grid = vec![vec![' '; COLS]; ROWS];
        self.row = 0;
        self.col = 0;
        self.saved = (0, 0);
        self.state = ParseState::Ground;
    }
}

impl Default for VirtualTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let mut vt = VirtualTerminal::new();
        vt.write("Welcome to The Sanctum BBS\r\nLogin:");
        assert_eq!(vt.snapshot(), "Welcome to The Sanctum BBS\nLogin:");
        assert_eq!(vt.cursor(), (1, 6));
    }

    #[test]
    fn test_snapshot_idempotent() {
        let mut vt = VirtualTerminal::new();
        vt.write("line one\r\n\x1b[5;10Hplaced\x1b[K");
        let a = vt.snapshot();
        let b = vt.snapshot();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cursor_positioning() {
        let mut vt = VirtualTerminal::new();
        vt.write("\x1b[3;5HX");
        let snapshot = vt.snapshot();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "    X");
    }

    #[test]
    fn test_color_discarded() {
        let mut vt = VirtualTerminal::new();
        vt.write("\x1b[1;33mYELLOW\x1b[0m text");
        assert_eq!(vt.snapshot(), "YELLOW text");
    }

    #[test]
    fn test_clear_screen() {
        let mut vt = VirtualTerminal::new();
        vt.write("old contents\r\nmore");
        vt.write("\x1b[2J\x1b[Hfresh");
        assert_eq!(vt.snapshot(), "fresh");
        assert_eq!(vt.cursor(), (0, 5));
    }

    #[test]
    fn test_erase_to_end_of_line() {
        let mut vt = VirtualTerminal::new();
        vt.write("abcdef\x1b[1;4H\x1b[K");
        assert_eq!(vt.snapshot(), "abc");
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut vt = VirtualTerminal::new();
        for i in 0..30 {
            vt.write(&format!("line {}\r\n", i));
        }
        let snapshot = vt.snapshot();
        assert!(snapshot.starts_with("line 7"));
        assert!(snapshot.contains("line 29"));
    }

    #[test]
    fn test_line_wrap() {
        let mut vt = VirtualTerminal::new();
        vt.write(&"x".repeat(85));
        let snapshot = vt.snapshot();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines[0].len(), 80);
        assert_eq!(lines[1], "xxxxx");
    }

    #[test]
    fn test_escape_split_across_writes() {
        let mut vt = VirtualTerminal::new();
        vt.write("\x1b[3");
        vt.write(";5HX");
        let snapshot = vt.snapshot();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines[2], "    X");
    }

    #[test]
    fn test_tail_skips_blank_lines() {
        let mut vt = VirtualTerminal::new();
        vt.write("top\r\n\r\n\r\nbottom\r\nprompt:");
        assert_eq!(vt.tail(2), "bottom\nprompt:");
    }

    #[test]
    fn test_reset() {
        let mut vt = VirtualTerminal::new();
        vt.write("something");
        vt.reset();
        assert_eq!(vt.snapshot(), "");
        assert_eq!(vt.cursor(), (0, 0));
    }

    #[test]
    fn test_backspace_and_tab() {
        let mut vt = VirtualTerminal::new();
        vt.write("ab\x08c\tz");
        assert_eq!(vt.snapshot(), "ac      z");
    }
}
