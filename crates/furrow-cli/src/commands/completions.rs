use std::io;

use clap::CommandFactory;
use clap_complete::{generate, shells};

use crate::cli::{Cli, CompletionShell};

pub fn run_completions(shell: CompletionShell) {
    let mut command = Cli::command();
    let mut stdout = io::stdout();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut command, "furrow", &mut stdout),
        CompletionShell::Zsh => generate(shells::Zsh, &mut command, "furrow", &mut stdout),
        CompletionShell::Fish => generate(shells::Fish, &mut command, "furrow", &mut stdout),
    }
}
