use {
    async_trait::async_trait,
    clap::Parser,
    log::warn,
    nix::unistd::{User, getuid},
    ninep::{
        context::Context,
        fs::{File, Fs},
        session::{
            AttachOptions, AuthStream, Authenticator, DialFsOptions, DialOptions, dial_fs,
        },
        *,
    },
    std::{env, sync::Arc, time::Duration},
    tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Command {
    /// Copy a file to stdout
    Cat,
    /// Copy stdin into a file, truncating it
    Write,
    /// Print one line describing a file
    Stat,
    /// Print one line per directory entry
    Ls,
    /// Talk to an rpc file: print its replies, send stdin lines as requests
    Rpc,
}

#[derive(Debug, clap::Parser)]
#[command(name = "9ptool", after_help = "e.g. 9ptool cat sources/plan9/NOTICE")]
struct Cli {
    /// Username to attach as [default: $USER]
    #[arg(long)]
    uname: Option<String>,

    /// File tree to attach to (may be empty)
    #[arg(long, default_value = "")]
    aname: String,

    /// Maximum message size to offer the server
    #[arg(long, default_value_t = 8192)]
    msize: u32,

    /// Maximum number of requests in flight
    #[arg(long, default_value_t = 256)]
    concurrency: u16,

    /// Give up after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    cmd: Command,

    /// service/path, where service is
    /// proto!address!port, host:port or a plan9port service name
    path: String,
}

fn default_uname() -> String {
    if let Ok(user) = env::var("USER") {
        return user;
    }
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => "none".to_owned(),
    }
}

/// `service/some/file` → (`service`, `some/file`)
fn split_target(arg: &str) -> (&str, &str) {
    arg.split_once('/').unwrap_or((arg, ""))
}

fn format_stat(stat: &Stat) -> String {
    format!(
        "{} {:8} {:>8} {:>8} {}",
        stat.mode_string(),
        stat.length,
        stat.uid,
        stat.gid,
        stat.name
    )
}

async fn cat(ctx: &Context, fs: &Fs, path: &str) -> Result<()> {
    let mut file = fs.open(ctx, path).await?;
    let mut stdout = io::stdout();
    let mut buf = vec![0; file.iounit() as usize];
    loop {
        let n = file.read(ctx, &mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
    }
    stdout.flush().await?;
    file.close(ctx).await
}

async fn write(ctx: &Context, fs: &Fs, path: &str) -> Result<u64> {
    let mut file = fs
        .open_file(ctx, path, OpenMode::WRITE | OpenMode::TRUNC)
        .await?;
    let mut stdin = io::stdin();
    let mut buf = vec![0; file.iounit() as usize];
    let mut total = 0;
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += file.write(ctx, &buf[..n]).await? as u64;
    }
    file.close(ctx).await?;
    Ok(total)
}

/// A request/reply conversation with a program behind a file
#[async_trait]
trait Exchange: Send {
    async fn recv(&mut self) -> ninep::Result<Vec<u8>>;
    async fn send(&mut self, data: &[u8]) -> ninep::Result<()>;
}

#[async_trait]
impl<'a> Exchange for AuthStream<'a> {
    async fn recv(&mut self) -> ninep::Result<Vec<u8>> {
        AuthStream::read(self, 8192).await
    }

    async fn send(&mut self, data: &[u8]) -> ninep::Result<()> {
        AuthStream::write(self, data).await
    }
}

struct RpcFile<'a> {
    file: &'a mut File,
    ctx: &'a Context,
}

#[async_trait]
impl Exchange for RpcFile<'_> {
    async fn recv(&mut self) -> ninep::Result<Vec<u8>> {
        let mut buf = vec![0; self.file.iounit() as usize];
        let n = self.file.read(self.ctx, &mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn send(&mut self, data: &[u8]) -> ninep::Result<()> {
        self.file.write(self.ctx, data).await.map(|_| ())
    }
}

/// Print what the other side has to say, then send the next line of `input`
/// NUL-terminated. Ends when `input` runs dry.
async fn interact<E, I>(chan: &mut E, input: &mut I) -> ninep::Result<()>
where
    E: Exchange + ?Sized,
    I: AsyncBufRead + Send + Unpin,
{
    let mut line = String::new();
    loop {
        loop {
            match chan.recv().await {
                Ok(data) if data.is_empty() => break,
                Ok(data) => println!("*** {}", String::from_utf8_lossy(&data)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    println!("err: {}", e);
                    break;
                }
            }
        }

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let mut request = line.trim_end_matches('\n').as_bytes().to_vec();
        request.push(0);
        match chan.send(&request).await {
            Ok(()) => {}
            Err(e)
                if e
                    .remote_message()
                    .is_some_and(|m| m.starts_with("bad rpc verb")) =>
            {
                warn!("{}", e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Lets the user answer the server's auth protocol on the terminal
struct Interactive;

#[async_trait]
impl Authenticator for Interactive {
    async fn authenticate(&self, stream: &mut AuthStream<'_>) -> ninep::Result<()> {
        interact(stream, &mut BufReader::new(io::stdin())).await
    }
}

async fn rpc(ctx: &Context, fs: &Fs, path: &str) -> Result<()> {
    let mut file = fs.open_file(ctx, path, OpenMode::RDWR).await?;
    let result = interact(
        &mut RpcFile {
            file: &mut file,
            ctx,
        },
        &mut BufReader::new(io::stdin()),
    )
    .await;
    let closed = file.close(ctx).await;
    result.and(closed)
}

async fn ninep_main(
    Cli {
        uname,
        aname,
        msize,
        concurrency,
        timeout,
        cmd,
        path,
    }: Cli,
) -> ninep::Result<i32> {
    let (service, path) = split_target(&path);
    let opts = DialFsOptions {
        dial: DialOptions::default()
            .with_msize(msize)
            .with_concurrency(concurrency),
        attach: AttachOptions::default()
            .with_uname(&uname.unwrap_or_else(default_uname))
            .with_aname(&aname)
            .with_authenticator(Arc::new(Interactive)),
    };
    let ctx = match timeout {
        Some(secs) => Context::with_timeout(Duration::from_secs(secs)),
        None => Context::background(),
    };

    let fs = dial_fs(service, &opts).await?;
    let result = match cmd {
        Command::Cat => cat(&ctx, &fs, path).await,
        Command::Write => write(&ctx, &fs, path).await.map(|n| {
            println!("{} bytes written.", n);
        }),
        Command::Stat => fs.stat(&ctx, path).await.map(|stat| {
            println!("{}", format_stat(&stat));
        }),
        Command::Ls => fs.read_dir(&ctx, path).await.map(|entries| {
            for entry in &entries {
                println!("{}", format_stat(entry));
            }
        }),
        Command::Rpc => rpc(&ctx, &fs, path).await,
    };

    let closed = fs.close(&ctx).await;
    result.and(closed).and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ninep_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        1
    });

    std::process::exit(exit_code);
}
