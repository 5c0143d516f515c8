use std::{fs, path::Path};

use slowctl_protocol::Role;

use crate::{
    command::{CommandDefinition, HighLevelCommand, LowLevelCommand, Priority},
    error::{GrammarError, GrammarErrorKind, LoadError},
};

/// Position of the parser relative to the blocks of a definition file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Block {
    Outside,
    Definitions,
    MacroName,
    MacroBody,
}

impl Block {
    fn describe(self) -> &'static str {
        match self {
            Block::Outside => "top level",
            Block::Definitions => "DEFINITIONS",
            Block::MacroName | Block::MacroBody => "SEQUENCE",
        }
    }
}

/// Catalogue of command definitions and the macros built from them.
///
/// A definition file has two kinds of blocks:
///
/// ```text
/// BEGIN DEFINITIONS
/// PI read_voltage 3 0 0    # <device> <name> <ints> <floats> <strings>
/// END DEFINITIONS
///
/// BEGIN SEQUENCE
/// poll_voltage
/// PI read_voltage CHK 1 INT 0 INT 0 INT 0
/// END SEQUENCE
/// ```
///
/// A sequence line may only use definitions that appear earlier in the file.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    definitions: Vec<CommandDefinition>,
    macros: Vec<HighLevelCommand>,
}

impl Registry {
    /// Reads and parses the definition file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Registry, LoadError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Registry::parse(&source).map_err(|source| LoadError::Grammar {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!(
            "Loaded {} command definitions and {} sequences from {}",
            registry.definitions.len(),
            registry.macros.len(),
            path.display()
        );
        Ok(registry)
    }

    /// Parses a complete definition file. Any bad line fails the whole parse.
    pub fn parse(source: &str) -> Result<Registry, GrammarError> {
        let mut registry = Registry::default();
        let mut block = Block::Outside;
        let mut last_line = 0;

        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            last_line = line;
            let content = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();
            if content.is_empty() {
                continue;
            }
            let words: Vec<&str> = content.split_whitespace().collect();
            let fail = |kind| GrammarError { line, kind };

            block = match (block, words.as_slice()) {
                (Block::Outside, ["BEGIN", "DEFINITIONS"]) => Block::Definitions,
                (Block::Outside, ["BEGIN", "SEQUENCE"]) => Block::MacroName,
                (Block::Outside, _) => {
                    return Err(fail(GrammarErrorKind::UnexpectedLine(content.to_string())));
                }
                (Block::Definitions, ["END", "DEFINITIONS"]) => Block::Outside,
                (Block::Definitions, _) => {
                    let definition = parse_definition(content, &words).map_err(fail)?;
                    registry.add_definition(definition).map_err(fail)?;
                    Block::Definitions
                }
                (Block::MacroName, [name]) => {
                    if registry.macro_named(name).is_some() {
                        return Err(fail(GrammarErrorKind::DuplicateMacro(name.to_string())));
                    }
                    registry.macros.push(HighLevelCommand {
                        name: name.to_string(),
                        commands: Vec::new(),
                    });
                    Block::MacroBody
                }
                (Block::MacroName, _) => {
                    return Err(fail(GrammarErrorKind::InvalidMacroName(content.to_string())));
                }
                (Block::MacroBody, ["END", "SEQUENCE"]) => Block::Outside,
                (Block::MacroBody, _) => {
                    let command = registry.parse_command(content, &words).map_err(fail)?;
                    if let Some(current) = registry.macros.last_mut() {
                        current.commands.push(command);
                    }
                    Block::MacroBody
                }
            };
        }

        if block != Block::Outside {
            return Err(GrammarError {
                line: last_line,
                kind: GrammarErrorKind::UnterminatedBlock(block.describe()),
            });
        }
        Ok(registry)
    }

    pub fn definitions(&self) -> &[CommandDefinition] {
        &self.definitions
    }

    pub fn macros(&self) -> &[HighLevelCommand] {
        &self.macros
    }

    pub fn macro_named(&self, name: &str) -> Option<&HighLevelCommand> {
        self.macros.iter().find(|m| m.name == name)
    }

    /// The definition `device name` with exactly the given argument counts.
    pub fn resolve(
        &self,
        device: Role,
        name: &str,
        arity: (usize, usize, usize),
    ) -> Option<&CommandDefinition> {
        self.definitions
            .iter()
            .find(|d| d.accepts(device, name, arity))
    }

    fn add_definition(&mut self, definition: CommandDefinition) -> Result<(), GrammarErrorKind> {
        let arity = (definition.n_ints, definition.n_floats, definition.n_strings);
        if self
            .resolve(definition.device, &definition.name, arity)
            .is_some()
        {
            return Err(GrammarErrorKind::DuplicateDefinition {
                device: device_code(definition.device),
                name: definition.name,
                n_ints: arity.0,
                n_floats: arity.1,
                n_strings: arity.2,
            });
        }
        self.definitions.push(definition);
        Ok(())
    }

    /// `<device> <name> [CHK <priority>] [INT <v> | FLT <v> | STR <v>]*`
    fn parse_command(
        &self,
        content: &str,
        words: &[&str],
    ) -> Result<LowLevelCommand, GrammarErrorKind> {
        let [code, name, tagged @ ..] = words else {
            return Err(GrammarErrorKind::MalformedCommand(content.to_string()));
        };
        if tagged.len() % 2 != 0 {
            return Err(GrammarErrorKind::MalformedCommand(content.to_string()));
        }
        let device = parse_device(code)?;

        let mut priority = Priority::default();
        let mut int_args = Vec::new();
        let mut float_args = Vec::new();
        let mut string_args = Vec::new();
        for (position, pair) in tagged.chunks_exact(2).enumerate() {
            let (tag, value) = (pair[0], pair[1]);
            match tag {
                "CHK" if position == 0 => {
                    priority = value
                        .parse::<u8>()
                        .ok()
                        .and_then(|level| Priority::try_from(level).ok())
                        .ok_or_else(|| GrammarErrorKind::InvalidPriority(value.to_string()))?;
                }
                "CHK" => return Err(GrammarErrorKind::MisplacedPriority),
                "INT" => int_args.push(parse_number(value)?),
                "FLT" => float_args.push(parse_float(value)?),
                "STR" => string_args.push(value.to_string()),
                other => return Err(GrammarErrorKind::UnknownTag(other.to_string())),
            }
        }

        let arity = (int_args.len(), float_args.len(), string_args.len());
        let definition = self.resolve(device, name, arity).ok_or_else(|| {
            GrammarErrorKind::UnresolvedCommand {
                device: code.to_string(),
                name: name.to_string(),
                n_ints: arity.0,
                n_floats: arity.1,
                n_strings: arity.2,
            }
        })?;
        Ok(LowLevelCommand {
            definition: definition.clone(),
            priority,
            int_args,
            float_args,
            string_args,
        })
    }
}

/// `<device> <name> <ints> <floats> <strings>`
fn parse_definition(content: &str, words: &[&str]) -> Result<CommandDefinition, GrammarErrorKind> {
    let [code, name, n_ints, n_floats, n_strings] = words else {
        return Err(GrammarErrorKind::MalformedDefinition(content.to_string()));
    };
    Ok(CommandDefinition::new(
        parse_device(code)?,
        *name,
        parse_number(n_ints)?,
        parse_number(n_floats)?,
        parse_number(n_strings)?,
    ))
}

fn parse_device(code: &str) -> Result<Role, GrammarErrorKind> {
    Role::from_device_code(code).ok_or_else(|| GrammarErrorKind::UnknownDevice(code.to_string()))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, GrammarErrorKind> {
    value
        .parse()
        .map_err(|_| GrammarErrorKind::InvalidNumber(value.to_string()))
}

/// Finite floats only: JSON has no encoding for NaN or infinity.
fn parse_float(value: &str) -> Result<f32, GrammarErrorKind> {
    let number: f32 = parse_number(value)?;
    if number.is_finite() {
        Ok(number)
    } else {
        Err(GrammarErrorKind::InvalidNumber(value.to_string()))
    }
}

fn device_code(role: Role) -> String {
    role.device_code().unwrap_or("??").to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    const DEFINITIONS: &str = "\
BEGIN DEFINITIONS
PI read_voltage 3 0 0
PI set_voltage 2 1 0
TM read_temperature 0 0 0
RC wait 0 1 0
END DEFINITIONS
";

    fn parse(body: &str) -> Result<Registry, GrammarError> {
        Registry::parse(&format!("{DEFINITIONS}{body}"))
    }

    fn kind(result: Result<Registry, GrammarError>) -> GrammarErrorKind {
        result.unwrap_err().kind
    }

    #[test]
    fn parses_definitions_and_sequences() {
        let registry = parse(
            "
# ramp the first board
BEGIN SEQUENCE
ramp_up
PI set_voltage CHK 1 INT 0 INT 3 FLT 12.5   # board 0, channel 3
RC wait FLT 0.5
PI read_voltage INT 0 INT 0 INT 0
END SEQUENCE

BEGIN SEQUENCE
temperature
TM read_temperature CHK 2
END SEQUENCE
",
        )
        .unwrap();

        assert_eq!(registry.definitions().len(), 4);
        assert_eq!(registry.macros().len(), 2);

        let ramp = registry.macro_named("ramp_up").unwrap();
        assert_eq!(ramp.commands.len(), 3);
        assert_eq!(ramp.commands[0].name(), "set_voltage");
        assert_eq!(ramp.commands[0].priority, Priority::Device);
        assert_eq!(ramp.commands[0].int_args, vec![0, 3]);
        assert_eq!(ramp.commands[0].float_args, vec![12.5]);
        assert_eq!(ramp.commands[1].device(), Role::Coordinator);
        assert_eq!(ramp.commands[2].priority, Priority::Free);

        let temperature = registry.macro_named("temperature").unwrap();
        assert_eq!(temperature.commands[0].device(), Role::ModuleNode);
        assert_eq!(temperature.commands[0].priority, Priority::Global);
        assert!(registry.macro_named("missing").is_none());
    }

    #[test]
    fn tags_keep_their_order_within_each_list() {
        let registry = Registry::parse(
            "BEGIN DEFINITIONS\nPI mixed 2 0 2\nEND DEFINITIONS\n\
             BEGIN SEQUENCE\nm\nPI mixed STR a INT 7 STR b INT 9\nEND SEQUENCE\n",
        )
        .unwrap();
        let command = &registry.macro_named("m").unwrap().commands[0];
        assert_eq!(command.int_args, vec![7, 9]);
        assert_eq!(command.string_args, vec!["a", "b"]);
    }

    #[test]
    fn empty_file_is_an_empty_registry() {
        let registry = Registry::parse("# nothing here\n\n").unwrap();
        assert!(registry.definitions().is_empty());
        assert!(registry.macros().is_empty());
    }

    #[test]
    fn arity_mismatch_fails_the_whole_load() {
        let error = parse(
            "BEGIN SEQUENCE\ngood\nPI read_voltage INT 0 INT 0 INT 0\nEND SEQUENCE\n\
             BEGIN SEQUENCE\nbad\nPI read_voltage INT 0\nEND SEQUENCE\n",
        )
        .unwrap_err();
        assert_eq!(error.line, 13);
        assert_eq!(
            error.kind,
            GrammarErrorKind::UnresolvedCommand {
                device: "PI".to_string(),
                name: "read_voltage".to_string(),
                n_ints: 1,
                n_floats: 0,
                n_strings: 0,
            }
        );
    }

    #[test]
    fn device_must_match_definition() {
        assert!(matches!(
            kind(parse("BEGIN SEQUENCE\nm\nTM read_voltage INT 0 INT 0 INT 0\nEND SEQUENCE\n")),
            GrammarErrorKind::UnresolvedCommand { .. }
        ));
    }

    #[test]
    fn priority_must_come_first() {
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\nm\nRC wait FLT 1 CHK 1\nEND SEQUENCE\n")),
            GrammarErrorKind::MisplacedPriority
        );
    }

    #[test]
    fn priority_out_of_range() {
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\nm\nTM read_temperature CHK 3\nEND SEQUENCE\n")),
            GrammarErrorKind::InvalidPriority("3".to_string())
        );
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\nm\nRC wait FLT\nEND SEQUENCE\n")),
            GrammarErrorKind::MalformedCommand("RC wait FLT".to_string())
        );
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\nm\nRC wait BOOL 1\nEND SEQUENCE\n")),
            GrammarErrorKind::UnknownTag("BOOL".to_string())
        );
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\nm\nRC wait FLT fast\nEND SEQUENCE\n")),
            GrammarErrorKind::InvalidNumber("fast".to_string())
        );
        assert_eq!(
            kind(parse("BEGIN SEQUENCE\ntwo words\nEND SEQUENCE\n")),
            GrammarErrorKind::InvalidMacroName("two words".to_string())
        );
        assert_eq!(
            kind(Registry::parse("BEGIN DEFINITIONS\nXX foo 0 0 0\nEND DEFINITIONS\n")),
            GrammarErrorKind::UnknownDevice("XX".to_string())
        );
        assert_eq!(
            kind(Registry::parse("BEGIN DEFINITIONS\nPI foo 0 0\nEND DEFINITIONS\n")),
            GrammarErrorKind::MalformedDefinition("PI foo 0 0".to_string())
        );
        assert_eq!(
            kind(Registry::parse("PI foo 0 0 0\n")),
            GrammarErrorKind::UnexpectedLine("PI foo 0 0 0".to_string())
        );
    }

    #[test]
    fn float_arguments_must_be_finite() {
        for value in ["nan", "NaN", "inf", "-infinity", "1e39"] {
            let error = parse(&format!(
                "BEGIN SEQUENCE\nm\nPI set_voltage CHK 2 INT 0 INT 1 FLT {value}\nEND SEQUENCE\n"
            ))
            .unwrap_err();
            assert_eq!(error.kind, GrammarErrorKind::InvalidNumber(value.to_string()));
            assert_eq!(error.line, 9);
        }
        let registry = parse("BEGIN SEQUENCE\nm\nRC wait FLT 3.4e38\nEND SEQUENCE\n").unwrap();
        assert_eq!(registry.macro_named("m").unwrap().commands[0].float_args, [3.4e38]);
    }

    #[test]
    fn duplicate_macro_is_rejected() {
        let error = parse(
            "BEGIN SEQUENCE\nm\nEND SEQUENCE\nBEGIN SEQUENCE\nm\nEND SEQUENCE\n",
        )
        .unwrap_err();
        assert_eq!(error.kind, GrammarErrorKind::DuplicateMacro("m".to_string()));
        assert_eq!(error.line, 11);
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        assert!(matches!(
            kind(Registry::parse(
                "BEGIN DEFINITIONS\nPI foo 1 0 0\nPI foo 1 0 0\nEND DEFINITIONS\n"
            )),
            GrammarErrorKind::DuplicateDefinition { .. }
        ));
        // same name with a different arity is a separate definition
        assert!(
            Registry::parse("BEGIN DEFINITIONS\nPI foo 1 0 0\nPI foo 2 0 0\nEND DEFINITIONS\n")
                .is_ok()
        );
    }

    #[test]
    fn unterminated_blocks() {
        for (source, block) in [
            ("BEGIN DEFINITIONS\nPI foo 0 0 0\n", "DEFINITIONS"),
            ("BEGIN DEFINITIONS\nPI foo 0 0 0\nEND DEFINITIONS\nBEGIN SEQUENCE\n", "SEQUENCE"),
            (
                "BEGIN DEFINITIONS\nPI foo 0 0 0\nEND DEFINITIONS\nBEGIN SEQUENCE\nm\nPI foo\n",
                "SEQUENCE",
            ),
        ] {
            assert_eq!(
                kind(Registry::parse(source)),
                GrammarErrorKind::UnterminatedBlock(block)
            );
        }
    }

    #[test]
    fn load_reports_path() {
        let path = std::env::temp_dir().join(format!("slowctl-missing-{}.config", std::process::id()));
        let error = Registry::load(&path).unwrap_err();
        assert!(matches!(error, LoadError::Io { .. }));
        assert!(error.to_string().contains("slowctl-missing"));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("slowctl-registry-{}.config", std::process::id()));
        fs::write(
            &path,
            format!("{DEFINITIONS}BEGIN SEQUENCE\nwait\nRC wait FLT 1\nEND SEQUENCE\n"),
        )
        .unwrap();
        let registry = Registry::load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(registry.macro_named("wait").unwrap().commands.len(), 1);
    }
}
