//! Binary that emits the server's command-line options as markdown to stdout.

fn main() {
    print!("{}", dacp_cli::render_options_markdown());
}
