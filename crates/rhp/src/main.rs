use std::env;
use std::process::ExitCode;

use rhp::{Options, Preprocessor, ProcessOptions};

pub fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let input = match args.next() {
        Some(input) => input,
        None => {
            eprintln!("usage: rhp <file>");
            return ExitCode::FAILURE;
        }
    };

    let engine = Preprocessor::new(Options::default());
    let output = engine.process(&input, ProcessOptions::default());
    println!("{output}");

    ExitCode::SUCCESS
}
