/// One parsed line of the retrieval dialogue. Parsing is token-based: the
/// first whitespace-separated word is the verb, the second (if any) is the
/// argument, so short or padded lines never trip position checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Pop3Command {
    User(Option<String>),
    Pass(Option<String>),
    Stat,
    List,
    Uidl,
    Retr(Option<String>),
    Dele(Option<String>),
    Top(Option<String>),
    Capa,
    Quit,
    Unknown(String),
}

impl Pop3Command {
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("").to_uppercase();
        let arg = tokens.next().map(str::to_string);

        match verb.as_str() {
            "USER" => Pop3Command::User(arg),
            "PASS" => Pop3Command::Pass(arg),
            "STAT" => Pop3Command::Stat,
            "LIST" => Pop3Command::List,
            "UIDL" => Pop3Command::Uidl,
            "RETR" => Pop3Command::Retr(arg),
            "DELE" => Pop3Command::Dele(arg),
            "TOP" => Pop3Command::Top(arg),
            "CAPA" => Pop3Command::Capa,
            "QUIT" => Pop3Command::Quit,
            _ => Pop3Command::Unknown(verb),
        }
    }
}
