use std::env;
use std::path::{Path, PathBuf};

const WATCHED_VARIABLES: &[&str] = &["FFMPEG_DIR", "VCPKG_ROOT", "VCPKGRS_DYNAMIC", "VCPKGRS_TRIPLET"];

fn main() {
    for variable in WATCHED_VARIABLES {
        println!("cargo:rerun-if-env-changed={variable}");
    }

    // ffmpeg-sys-next finds FFmpeg through pkg-config everywhere but Windows.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") || env::var_os("FFMPEG_DIR").is_some()
    {
        return;
    }

    match env::var("VCPKG_ROOT") {
        Ok(root) => report_vcpkg_install(&vcpkg_install_dir(&root)),
        Err(_) => println!(
            "cargo:warning=gifsmith needs FFmpeg. On Windows install it with vcpkg and set VCPKG_ROOT and FFMPEG_DIR."
        ),
    }
}

fn vcpkg_install_dir(root: &str) -> PathBuf {
    let triplet = env::var("VCPKGRS_TRIPLET").unwrap_or_else(|_| "x64-windows".to_string());
    Path::new(root).join("installed").join(triplet)
}

fn report_vcpkg_install(dir: &Path) {
    if !dir.exists() {
        println!("cargo:warning=VCPKG_ROOT is set but {} does not exist.", dir.display());
        return;
    }
    println!(
        "cargo:warning=Using vcpkg FFmpeg at {0}; set FFMPEG_DIR={0} to silence this message.",
        dir.display()
    );
    if env::var_os("VCPKGRS_DYNAMIC").is_none() {
        println!("cargo:warning=Set VCPKGRS_DYNAMIC=1 if the vcpkg FFmpeg build is dynamic.");
    }
}
