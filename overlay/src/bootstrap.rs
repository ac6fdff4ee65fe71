//! Assembles the self-extracting bootstrap that turns a freshly spawned
//! interpreter into a routable peer.
//!
//! Two pieces travel to the child: the *boot command* (a tiny decoder
//! embedded in an interpreter `-c` argument) and the *preamble* (the
//! lower-layer runtime source, minimised and deflate-compressed, written to
//! the child's stdin once it signals `EC0\n`).

use crate::{config::RuntimeConfig, minimiser::minimize_source};
use flate2::{write::ZlibEncoder, Compression};
use std::io::Write;

/// Markers the parent stream watches for during the handshake (§6).
pub const EC0: &[u8] = b"EC0\n";
pub const EC1: &[u8] = b"EC1\n";

/// The first-stage program, decoded once it is run by the target
/// interpreter. `{name}`, `{compressed_len}` and `{preamble_len}` are
/// substituted before compression.
const FIRST_STAGE_TEMPLATE: &str = r#"
import os, sys
R, W = os.pipe()
r, w = os.pipe()
if os.fork():
    os.dup2(0, 100)
    os.dup2(R, 0)
    os.dup2(r, 101)
    for fd in (R, r, W, w):
        if fd > 101:
            os.close(fd)
    os.environ['ARGV0'] = sys.executable
    os.execv(sys.executable, [sys.executable + '(overlay:{name})'])
else:
    os.write(1, b'EC0\n')
    compressed = os.fdopen(0, 'rb').read({compressed_len})
    data = __import__('zlib').decompress(compressed)
    os.write(W, data)
    os.write(w, ('%d\n' % {preamble_len}).encode() + compressed)
    os.write(1, b'EC1\n')
"#;

/// A fully assembled boot command: the interpreter argv to exec, and the
/// deflate-compressed preamble bytes to write once `EC0\n` is observed.
pub struct Bootstrap {
    pub argv: Vec<String>,
    pub compressed_preamble: Vec<u8>,
}

/// Builds the boot command and preamble for `remote_name`, given the
/// preamble's uncompressed source and the current runtime configuration.
pub fn assemble(config: &RuntimeConfig, remote_name: &str, preamble_source: &str) -> Bootstrap {
    let minimised = minimize_source(preamble_source);
    let compressed_preamble = deflate(minimised.as_bytes());

    let first_stage = FIRST_STAGE_TEMPLATE
        .replace("{name}", remote_name)
        .replace("{compressed_len}", &compressed_preamble.len().to_string())
        .replace("{preamble_len}", &minimised.len().to_string());

    let compressed_first_stage = deflate(first_stage.as_bytes());
    let encoded = base64::encode(&compressed_first_stage);

    let decoder = format!(
        "import zlib,base64;exec(zlib.decompress(base64.b64decode('{}')))",
        encoded
    );

    Bootstrap {
        argv: vec![
            config.interpreter.to_string_lossy().into_owned(),
            "-c".to_string(),
            decoder,
        ],
        compressed_preamble,
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory writer");
    encoder.finish().expect("in-memory writer")
}

/// Decoration applied to argv[0] of the re-exec'd interpreter, so the
/// process table and virtualenv prefix detection see the context name.
pub fn decorate_argv0(interpreter: &str, remote_name: &str) -> String {
    format!("{}(overlay:{})", interpreter, remote_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_command_roundtrips_through_deflate_and_base64() {
        let config = RuntimeConfig::default();
        let bootstrap = assemble(&config, "test.1", "x = 1\n");
        assert_eq!(bootstrap.argv.len(), 3);
        assert_eq!(bootstrap.argv[1], "-c");
        assert!(bootstrap.argv[2].contains("zlib.decompress"));

        let decompressed = flate2::read::ZlibDecoder::new(&bootstrap.compressed_preamble[..]);
        use std::io::Read;
        let mut out = String::new();
        let mut decompressed = decompressed;
        decompressed.read_to_string(&mut out).unwrap();
        assert!(out.contains('1'));
    }

    #[test]
    fn decorates_argv0_with_context_name() {
        assert_eq!(
            decorate_argv0("/usr/bin/python3", "local.123"),
            "/usr/bin/python3(overlay:local.123)"
        );
    }
}
