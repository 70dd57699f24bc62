//! Compiler argv parser.
//!
//! Splits a gcc/clang-style command line into the parts the classifier cares
//! about: the `-c` switch, the `-o` target, positional inputs and everything
//! else in original order.

/// Flags whose value is the following token when given bare (`-I dir`).
const FLAGS_WITH_SEPARATE_VALUES: &[&str] = &[
    "-I",
    "-D",
    "-U",
    "-L",
    "-l",
    "-F",
    "-x",
    "-include",
    "-imacros",
    "-isystem",
    "-iquote",
    "-idirafter",
    "-iprefix",
    "-iwithprefix",
    "-iwithprefixbefore",
    "-isysroot",
    "-MF",
    "-MT",
    "-MQ",
    "-arch",
    "-target",
    "--sysroot",
    "-Xclang",
    "-Xpreprocessor",
    "-Xassembler",
    "-Xlinker",
    "-aux-info",
];

/// Parsed compiler arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgv {
    /// `-c` was given.
    pub compile_only: bool,

    /// Value of `-o`, in either `-o x` or `-ox` form.
    pub output: Option<String>,

    /// Positional arguments (not flags, not flag values), in order.
    pub inputs: Vec<String>,

    /// Every other token in original order, flag values included.
    pub flags: Vec<String>,
}

impl ParsedArgv {
    /// Whether the exact token appears among the flags.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

/// Parse compiler argv (arguments after the compiler name).
///
/// Returns an error only for structurally broken command lines, such as a
/// trailing flag that needs a value.
pub fn parse_argv(argv: &[String]) -> Result<ParsedArgv, String> {
    let mut parsed = ParsedArgv::default();
    let mut iter = argv.iter();

    while let Some(arg) = iter.next() {
        if arg == "-c" {
            parsed.compile_only = true;
        } else if arg == "-o" {
            let value = iter
                .next()
                .ok_or_else(|| "flag -o requires a value".to_string())?;
            parsed.output = Some(value.clone());
        } else if let Some(value) = arg.strip_prefix("-o").filter(|v| !v.is_empty()) {
            parsed.output = Some(value.to_string());
        } else if FLAGS_WITH_SEPARATE_VALUES.contains(&arg.as_str()) {
            let value = iter
                .next()
                .ok_or_else(|| format!("flag {} requires a value", arg))?;
            parsed.flags.push(arg.clone());
            parsed.flags.push(value.clone());
        } else if arg == "-" || !arg.starts_with('-') {
            parsed.inputs.push(arg.clone());
        } else {
            parsed.flags.push(arg.clone());
        }
    }

    Ok(parsed)
}
