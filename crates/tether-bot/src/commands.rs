#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BotCommand {
    New,
}

struct CommandDef {
    command: BotCommand,
    patterns: &'static [&'static str],
}

const COMMAND_DEFS: &[CommandDef] = &[CommandDef {
    command: BotCommand::New,
    patterns: &["/new"],
}];

pub(crate) fn parse_command(text: &str) -> Option<BotCommand> {
    let trimmed = text.trim();

    COMMAND_DEFS.iter().find_map(|def| {
        def.patterns
            .iter()
            .any(|pattern| command_matches(trimmed, pattern))
            .then_some(def.command)
    })
}

/// Exact command, optionally addressed to a bot (`/new@name`).
fn command_matches(trimmed_text: &str, command: &str) -> bool {
    if trimmed_text == command {
        return true;
    }

    trimmed_text
        .strip_prefix(command)
        .is_some_and(|stripped| stripped.starts_with('@'))
}
