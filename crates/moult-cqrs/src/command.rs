//! Fire-and-forget commands.

use crate::argument::Arguments;

/// A command to be executed: a handler name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Arguments,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Arguments) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn into_parts(self) -> (String, Arguments) {
        (self.name, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_and_args() {
        let command = Command::new("add", Arguments::new().with("n", 3_i64));
        assert_eq!(command.name(), "add");
        assert_eq!(command.args().get_int("n"), Ok(3));

        let (name, args) = command.into_parts();
        assert_eq!(name, "add");
        assert_eq!(args.len(), 1);
    }
}
