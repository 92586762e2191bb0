use clap::CommandFactory;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=crates/dacp-cli/src/lib.rs");

    // Generate manpage using clap_mangen
    let cmd = dacp_cli::ServerArgs::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buffer: Vec<u8> = Default::default();
    man.render(&mut buffer)?;

    let out_dir = PathBuf::from(
        env::var("OUT_DIR").map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?,
    );
    fs::write(out_dir.join("dacp-server.1"), &buffer)?;

    // OUT_DIR is target/<profile>/build/xxx/out; three levels up is target/<profile>/
    if env::var("PROFILE").unwrap_or_default() == "release" {
        if let Some(release_dir) = out_dir.ancestors().nth(3) {
            fs::write(release_dir.join("dacp-server.1"), &buffer)?;
        }
    }

    Ok(())
}
