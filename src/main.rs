/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    env,
    fs::{self, File},
    io::{BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    process,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{error::ErrorKind, ArgAction, ArgGroup, CommandFactory, Parser};
use log::LevelFilter;
use mar::{
    add_signature_block,
    signing::{format_hash, key_size},
    Compression, Decompression, Mar, MarError, MarWriter, MarWriterOptions, SigningAlgorithm,
};

#[derive(Parser)]
#[command(name = "mar", version, about = "Utility for managing MAR files")]
#[command(disable_version_flag = true)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["create", "extract", "list", "list_detailed", "verify", "hash", "add_signature"])
))]
#[command(group(ArgGroup::new("compression").args(["bzip2", "xz", "auto"])))]
struct Cli {
    /// Create MAR
    #[arg(short = 'c', long, value_name = "MARFILE")]
    create: Option<PathBuf>,

    /// Product/version string
    #[arg(short = 'V', long = "productversion")]
    product_version: Option<String>,

    /// Channel this MAR file is applicable to
    #[arg(short = 'H', long)]
    channel: Option<String>,

    /// Extract MAR
    #[arg(short = 'x', long, value_name = "MARFILE")]
    extract: Option<PathBuf>,

    /// Print out MAR contents
    #[arg(short = 't', long, value_name = "MARFILE")]
    list: Option<PathBuf>,

    /// Print out MAR contents including signatures
    #[arg(short = 'T', long, value_name = "MARFILE")]
    list_detailed: Option<PathBuf>,

    /// Verify the MAR file
    #[arg(short = 'v', long, value_name = "MARFILE")]
    verify: Option<PathBuf>,

    /// Output the hash of MARFILE (given as FILES) for signing with ALGO
    #[arg(long, value_name = "ALGO", requires = "files")]
    hash: Option<SigningAlgorithm>,

    /// Output the hash wrapped in its ASN.1 DigestInfo
    #[arg(long, requires = "hash")]
    asn1: bool,

    /// Inject the signature in SIGFILE into a copy of INPUT
    #[arg(long, num_args = 3, value_names = ["INPUT", "OUTPUT", "SIGFILE"])]
    add_signature: Option<Vec<PathBuf>>,

    /// Compress/decompress members with bzip2
    #[arg(short = 'j', long)]
    bzip2: bool,

    /// Compress/decompress members with xz
    #[arg(short = 'J', long)]
    xz: bool,

    /// Automatically decompress members
    #[arg(long)]
    auto: bool,

    /// Sign/verify with given key(s)
    #[arg(short = 'k', long = "keyfiles", value_name = "KEY")]
    keyfiles: Vec<String>,

    /// Directory holding the named :mozilla-* public keys
    #[arg(long, env = "MAR_KEYS_DIR", value_name = "DIR")]
    keys_dir: Option<PathBuf>,

    /// Chdir to this directory before creating or extracting; location of
    /// marfile isn't affected by this option
    #[arg(short = 'C', long, value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long)]
    verbose: bool,

    /// Print version
    #[arg(long, action = ArgAction::Version)]
    version: Option<bool>,

    /// Files to add to the MAR file
    #[arg(trailing_var_arg = true)]
    files: Vec<PathBuf>,
}

impl Cli {
    fn compression(&self) -> Compression {
        if self.bzip2 {
            Compression::Bz2
        } else if self.xz {
            Compression::Xz
        } else {
            Compression::None
        }
    }

    fn decompression(&self) -> Decompression {
        if self.bzip2 {
            Decompression::Bz2
        } else if self.xz {
            Decompression::Xz
        } else if self.auto {
            Decompression::Auto
        } else {
            Decompression::None
        }
    }

    fn chdir(&self) -> Result<()> {
        if let Some(dir) = &self.chdir {
            env::set_current_dir(dir)
                .with_context(|| format!("Failed to change directory to '{}'", dir.display()))?;
        }
        Ok(())
    }
}

/// Public keys that can be named on the command line instead of given as a
/// path.  Each name maps to a SHA1 key and a SHA384 key.
struct KeyRegistry {
    dir: Option<PathBuf>,
}

const NAMED_KEYS: [&str; 3] = ["release", "nightly", "dep"];

impl KeyRegistry {
    fn resolve(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let name = match key.strip_prefix(":mozilla-") {
            Some(name) => name,
            None => {
                let data = fs::read(key).with_context(|| format!("Failed to read key '{}'", key))?;
                return Ok(vec![data]);
            }
        };

        if !NAMED_KEYS.contains(&name) {
            bail!("Invalid internal key name: {}", key);
        }
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| anyhow!("{} needs --keys-dir or MAR_KEYS_DIR", key))?;

        (1..=2)
            .map(|n| {
                let path = dir.join(format!("{}{}.pem", name, n));
                fs::read(&path)
                    .with_context(|| format!("Failed to read key '{}'", path.display()))
            })
            .collect()
    }
}

/// An error in how the tool was invoked, reported like clap's own.
fn usage<S: Into<String>>(message: S) -> anyhow::Error {
    MarError::Usage(message.into()).into()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(env::current_dir()?.join(path))
}

fn open(path: &Path) -> Result<Mar<BufReader<File>>> {
    Mar::from_path(path).with_context(|| format!("Failed to read MAR file '{}'", path.display()))
}

fn do_create(cli: &Cli, marfile: &Path) -> Result<()> {
    if cli.files.is_empty() {
        return Err(usage("Must specify at least one file to add to marfile"));
    }
    if cli.product_version.is_some() != cli.channel.is_some() {
        return Err(usage("--productversion and --channel must be given together"));
    }

    let mut options = MarWriterOptions::new();
    if let Some(product_version) = &cli.product_version {
        options = options.product_version(product_version.as_str());
    }
    if let Some(channel) = &cli.channel {
        options = options.channel(channel.as_str());
    }
    if let Some(keyfile) = cli.keyfiles.first() {
        let key = fs::read(keyfile).with_context(|| format!("Failed to read key '{}'", keyfile))?;
        let bits = key_size(&key)?;
        let algorithm = SigningAlgorithm::from_key_bits(bits)
            .ok_or_else(|| anyhow!("Unsupported key size {} from key {}", bits, keyfile))?;
        println!("Using {} to sign using algorithm {}", keyfile, algorithm);
        options = options.signing_key(key).signing_algorithm(algorithm);
    }

    let marfile = absolute(marfile)?;
    cli.chdir()?;

    let mut writer = MarWriter::create(&marfile, options)
        .with_context(|| format!("Failed to create '{}'", marfile.display()))?;
    for path in &cli.files {
        writer
            .add(path, cli.compression())
            .with_context(|| format!("Failed to add '{}'", path.display()))?;
    }
    writer.finish()?;
    Ok(())
}

fn do_extract(cli: &Cli, marfile: &Path) -> Result<()> {
    let mut mar = open(&absolute(marfile)?)?;
    cli.chdir()?;
    mar.extract(env::current_dir()?, cli.decompression())?;
    Ok(())
}

fn do_verify(cli: &Cli, marfile: &Path) -> Result<bool> {
    if cli.keyfiles.is_empty() {
        return Err(usage("Must specify a key file when verifying"));
    }

    let registry = KeyRegistry {
        dir: cli.keys_dir.clone(),
    };
    let mut keys = Vec::new();
    for keyfile in &cli.keyfiles {
        keys.extend(registry.resolve(keyfile)?);
    }

    let mut mar = open(marfile)?;
    for key in keys {
        if mar.verify(&key)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn do_list(marfile: &Path, detailed: bool) -> Result<()> {
    let mar = open(marfile)?;
    let info = mar.info();

    if detailed {
        if let Some(sigs) = info.signatures() {
            println!(
                "Signature block found with {} signature",
                sigs.signatures.len()
            );
            for (i, sig) in sigs.signatures.iter().enumerate() {
                let algorithm = SigningAlgorithm::from_id(sig.algorithm_id)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "unknown".to_owned());
                println!(
                    "  - Signature {} using {} ({} bytes)",
                    i + 1,
                    algorithm,
                    sig.signature.len()
                );
            }
        }
        if let Some(extras) = info.extras() {
            println!("{} additional block found:", extras.sections.len());
            for section in &extras.sections {
                match section {
                    mar::format::ExtraSection::ProductInfo(pib) => {
                        println!("  - Product Information Block:");
                        println!("    - MAR channel name: {}", pib.channel);
                        println!("    - Product version: {}", pib.product_version);
                        println!();
                    }
                    mar::format::ExtraSection::Unknown { id, data } => {
                        println!("  - Unknown additional data (id {}, {} bytes)", id, data.len());
                    }
                }
            }
        }
    }

    println!("{:<7} {:<7} {:<7}", "SIZE", "MODE", "NAME");
    for item in mar.files() {
        println!("{:<7} {:04o}    {}", item.length, item.flags, item.name);
    }

    if detailed {
        for error in mar.errors() {
            println!("warning: {}", error);
        }
    }
    Ok(())
}

fn do_hash(cli: &Cli, algorithm: SigningAlgorithm) -> Result<()> {
    let marfile = match cli.files.as_slice() {
        [marfile] => marfile,
        _ => return Err(usage("--hash needs exactly one MAR file")),
    };

    let mut src = BufReader::new(
        File::open(marfile).with_context(|| format!("Failed to open '{}'", marfile.display()))?,
    );
    let mut signed = tempfile::tempfile()?;
    add_signature_block(&mut src, &mut signed, algorithm, None)?;
    signed.seek(SeekFrom::Start(0))?;

    let mut mar = Mar::from_buffer(BufReader::new(signed))?;
    for (_, digest) in mar.calculate_hashes()? {
        let digest = if cli.asn1 {
            format_hash(&digest, algorithm)
        } else {
            digest
        };
        println!("{}", hex::encode(digest));
    }
    Ok(())
}

fn do_add_signature(paths: &[PathBuf]) -> Result<()> {
    let [input, output, sigfile] = paths else {
        return Err(usage("--add-signature needs INPUT OUTPUT SIGFILE"));
    };

    let signature =
        fs::read(sigfile).with_context(|| format!("Failed to read '{}'", sigfile.display()))?;
    let algorithm = match signature.len() {
        256 => SigningAlgorithm::Sha1,
        512 => SigningAlgorithm::Sha384,
        len => bail!("Unsupported signature size {} in '{}'", len, sigfile.display()),
    };

    let mut src = BufReader::new(
        File::open(input).with_context(|| format!("Failed to open '{}'", input.display()))?,
    );
    let mut dest =
        File::create(output).with_context(|| format!("Failed to create '{}'", output.display()))?;
    add_signature_block(&mut src, &mut dest, algorithm, Some(&signature))?;
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    if let Some(marfile) = &cli.create {
        do_create(cli, marfile)?;
    } else if let Some(marfile) = &cli.extract {
        do_extract(cli, marfile)?;
    } else if let Some(marfile) = &cli.verify {
        if do_verify(cli, marfile)? {
            println!("Verification OK");
        } else {
            println!("Verification failed");
            process::exit(1);
        }
    } else if let Some(marfile) = &cli.list {
        do_list(marfile, false)?;
    } else if let Some(marfile) = &cli.list_detailed {
        do_list(marfile, true)?;
    } else if let Some(algorithm) = cli.hash {
        do_hash(cli, algorithm)?;
    } else if let Some(paths) = &cli.add_signature {
        do_add_signature(paths)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .format_target(false)
        .filter_level(if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .parse_default_env()
        .init();

    match run(&cli) {
        Err(err) => match err.downcast_ref::<MarError>() {
            Some(MarError::Usage(message)) => {
                Cli::command().error(ErrorKind::ValueValidation, message).exit()
            }
            _ => Err(err),
        },
        ok => ok,
    }
}
