use crate::counters::parse_counters;

/// Input dialect of a rule stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `iptables-save -c` output, rule lines may start with `[packets:bytes]`
    Counters,
    /// Plain rule files, `[` tokens are ordinary values
    Plain,
}

impl Dialect {
    pub fn carries_counters(self) -> bool {
        matches!(self, Dialect::Counters)
    }
}

/// Output of tokenizing one rule line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTokens {
    /// Value of `-A`/`--append`, if the line had one
    pub chain: Option<String>,
    /// Every other flag followed by its values, in line order
    pub flags: Vec<String>,
    pub packets: u64,
    pub bytes: u64,
}

/// Groups the tokens of a rule line into flags and their values
#[derive(Debug)]
pub struct RuleTokenizer {
    dialect: Dialect,
    current: Option<String>,
    current_values: Vec<String>,
    out: RuleTokens,
}

impl RuleTokenizer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            current: None,
            current_values: vec![],
            out: RuleTokens::default(),
        }
    }

    /// Tokenize a whole line
    pub fn tokenize(dialect: Dialect, line: &str) -> RuleTokens {
        let mut tokenizer = Self::new(dialect);
        for token in line.split_whitespace() {
            tokenizer.handle_token(token);
        }
        tokenizer.finish()
    }

    pub fn handle_token(&mut self, token: &str) {
        if self.dialect.carries_counters() && token.starts_with('[') {
            if let Some((packets, bytes)) = parse_counters(token) {
                self.out.packets = packets;
                self.out.bytes = bytes;
                return;
            }
        }
        if token.starts_with('-') {
            self.flush();
            self.current = Some(token.to_string());
            return;
        }
        self.current_values.push(token.to_string());
    }

    pub fn finish(mut self) -> RuleTokens {
        self.flush();
        self.out
    }

    fn flush(&mut self) {
        let values = std::mem::take(&mut self.current_values);
        match self.current.take() {
            // values before the first flag have nowhere to go
            None => {}
            Some(flag) if flag == "-A" || flag == "--append" => {
                if let Some(chain) = values.into_iter().next() {
                    self.out.chain = Some(chain);
                }
            }
            Some(flag) => {
                self.out.flags.push(flag);
                self.out.flags.extend(values);
            }
        }
    }
}
