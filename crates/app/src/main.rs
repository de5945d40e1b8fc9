// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::{self, Read, Seek};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fl2k::{DataInfo, Fl2kDev, FL2K_BUF_LEN};

#[derive(Parser, Debug)]
#[command(name = "fl2k-play")]
#[command(about = "A sample player for FL2K VGA dongles")]
struct Cli {
    /// Device index
    #[arg(short = 'd', long, default_value = "0")]
    device: u32,

    /// Sample rate in Hz
    #[arg(short = 's', long, default_value = "100000000")]
    sample_rate: u32,

    /// Play the file once instead of looping
    #[arg(long)]
    once: bool,

    /// Treat the file as unsigned 8-bit samples (default: signed)
    #[arg(short = 'u', long)]
    unsigned: bool,

    /// File of raw 8-bit samples, or '-' to read from stdin
    filename: String,
}

enum Source {
    File(File),
    Stdin(io::Stdin),
}

impl Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::File(f) => f.read(buf),
            Source::Stdin(s) => s.read(buf),
        }
    }

    /// Seek back to the start; only files can loop.
    fn rewind(&mut self) -> bool {
        match self {
            Source::File(f) => f.rewind().is_ok(),
            Source::Stdin(_) => false,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut source = if cli.filename == "-" {
        Source::Stdin(io::stdin())
    } else {
        match File::open(&cli.filename) {
            Ok(f) => Source::File(f),
            Err(e) => {
                eprintln!("Failed to open {}: {}", cli.filename, e);
                std::process::exit(1);
            }
        }
    };

    let mut dev = match Fl2kDev::open(cli.device) {
        Ok(dev) => dev,
        Err(e) => {
            eprintln!("Failed to open fl2k device #{}: {}", cli.device, e);
            std::process::exit(1);
        }
    };

    let do_exit = Arc::new(AtomicBool::new(false));
    let exit_flag = do_exit.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nSignal caught, exiting!");
        exit_flag.store(true, Ordering::SeqCst);
    })
    .unwrap_or_else(|e| {
        eprintln!("error setting signal handler: {}", e);
        std::process::exit(1);
    });

    let underflows = Arc::new(AtomicU32::new(0));

    // Producer callback: refill one full buffer per invocation from the
    // file. On EOF either rewind or end the stream.
    let mut txbuf = vec![0u8; FL2K_BUF_LEN];
    let repeat = !cli.once;
    let signed = !cli.unsigned;
    let exit_flag = do_exit.clone();
    let underflow_out = underflows.clone();
    let mut repeat_cnt = 0u32;

    let producer = move |info: &mut DataInfo| {
        if info.device_error {
            eprintln!("Device error, exiting.");
            exit_flag.store(true, Ordering::SeqCst);
            return;
        }

        underflow_out.store(info.underflow_cnt, Ordering::Relaxed);

        info.sampletype_signed = signed;
        info.r_buf = txbuf.as_ptr();

        let mut left = FL2K_BUF_LEN;
        while !exit_flag.load(Ordering::SeqCst) && left > 0 {
            match source.read(&mut txbuf[FL2K_BUF_LEN - left..]) {
                Ok(0) => {
                    if repeat && source.rewind() {
                        repeat_cnt += 1;
                        eprintln!("repeat {}", repeat_cnt);
                    } else {
                        exit_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Ok(n) => left -= n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    eprintln!("File Error: {}", e);
                    exit_flag.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    };

    if let Err(e) = dev.start_tx(producer, 0) {
        eprintln!("Failed to start transmission: {}", e);
        std::process::exit(1);
    }

    // rate change after start: the device is already being fed, so the
    // higher clock does not underrun during PLL setup
    if let Err(e) = dev.set_sample_rate(cli.sample_rate) {
        eprintln!("WARNING: Failed to set sample rate: {}", e);
    }
    eprintln!("Streaming at {} S/s", dev.sample_rate());

    while !do_exit.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }

    let _ = dev.stop_tx();
    drop(dev);

    let n = underflows.load(Ordering::Relaxed);
    if n > 0 {
        eprintln!("{} underruns during playback", n);
    }
}
