//! tensix-emu: functional emulator for Tensix compute tiles
//!
//! The driver builds a machine from the configured architecture and runs a
//! small element-wise add program on a few worker tiles, checking the result
//! against a host reference.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use tensix_emu::config::Config;
use tensix_emu::device::arch_config::{NocArch, SocArch};
use tensix_emu::device::base_addr::{CbConfig, KernelConfig, RiscKind};
use tensix_emu::device::format::DataFormat;
use tensix_emu::device::riscv::{KernelRegistry, NativeCluster};
use tensix_emu::device::{Machine, Tensix};
use tensix_emu::kernel::dataflow::BankKind;
use tensix_emu::llk::pack_utils::{faces_to_tile, pack_tile, tile_to_faces, unpack_tile};
use tensix_emu::llk::TILE_SIZE;

const CONFIG_BASE: u32 = 110 * 1024;
const CB_IN0: u32 = 0;
const CB_IN1: u32 = 1;
const CB_OUT: u32 = 16;
const TILE_BYTES: u32 = 2048;
const CB_BASE: u32 = 200 * 1024;

const A_BASE: u32 = 0x0010_0000;
const B_BASE: u32 = 0x0020_0000;
const C_BASE: u32 = 0x0030_0000;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = Config::get().clone();
    let mut num_tiles = 4u32;
    let mut info_only = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--sample-config" => {
                print!("{}", Config::sample_config());
                return Ok(());
            }
            "--info" => info_only = true,
            "--arch" => {
                let name = iter.next().context("--arch needs a preset name")?;
                config.arch = Some(name.clone());
                config.grid = None;
            }
            "--tiles" => {
                let n = iter.next().context("--tiles needs a count")?;
                num_tiles = n.parse().with_context(|| format!("bad tile count '{}'", n))?;
            }
            other => bail!("unknown argument '{}' (try --help)", other),
        }
    }

    let arch = config.build_arch()?;
    print_arch(&arch);
    if info_only {
        return Ok(());
    }

    let kernels = Arc::new(KernelRegistry::new());
    let cluster = NativeCluster::new(kernels.clone());
    let machine = Machine::with_grid(arch, &cluster)?;
    let num_tiles = num_tiles.min(machine.tiles().len() as u32);
    if num_tiles == 0 {
        bail!("no worker tiles to run on");
    }

    run_eltwise_add(&machine, &kernels, num_tiles)?;
    machine.stop()?;
    Ok(())
}

fn print_usage() {
    println!("Usage: tensix-emu [--arch NAME] [--tiles N] [--info] [--sample-config]");
    println!();
    println!("  --arch NAME       architecture preset (grayskull, small)");
    println!("  --tiles N         number of worker tiles running the demo (default 4)");
    println!("  --info            print the architecture and exit");
    println!("  --sample-config   print a sample configuration file");
    if let Some(path) = Config::user_config_path() {
        println!();
        println!("User config: {}", path.display());
    }
}

fn print_arch<A: NocArch + SocArch>(arch: &A) {
    println!("Architecture: {}", SocArch::name(arch));
    println!("  mesh:          {}x{}", arch.noc_size_x(), arch.noc_size_y());
    println!("  workers:       {}x{}", arch.worker_x_size(), arch.worker_y_size());
    println!("  DRAM channels: {}", arch.num_dram_channels());
    println!("  PCIe core:     ({}, {})", arch.pcie_noc_x(), arch.pcie_noc_y());
    println!("  worker L1:     {} KB", arch.worker_l1_size() / 1024);
    println!();
}

/// `c[i] = a[i] + b[i]` for one tile per worker, tile `i` on worker `i`.
fn run_eltwise_add(machine: &Machine, kernels: &KernelRegistry, num_tiles: u32) -> anyhow::Result<()> {
    let num_banks = machine.noc_arch().num_dram_banks();

    let reader = kernels.register(|api| {
        let df = api.dataflow()?;
        let id = df.get_arg_uint32(0)?;
        for (cb, base) in [(CB_IN0, A_BASE), (CB_IN1, B_BASE)] {
            df.cb_reserve_back(cb, 1)?;
            let dst = df.get_write_ptr(cb)?;
            df.noc_async_read_tile(id, BankKind::Dram, base, TILE_BYTES, DataFormat::Float16B, dst, 0)?;
            df.noc_async_read_barrier()?;
            df.cb_push_back(cb, 1)?;
        }
        Ok(())
    });
    let compute = kernels.register(|api| {
        let c = api.compute()?;
        c.cb_wait_front(CB_IN0, 1)?;
        c.cb_wait_front(CB_IN1, 1)?;
        c.tile_regs_acquire()?;
        c.add_tiles(CB_IN0, CB_IN1, 0, 0, 0)?;
        c.tile_regs_commit()?;
        c.cb_pop_front(CB_IN0, 1)?;
        c.cb_pop_front(CB_IN1, 1)?;
        c.cb_reserve_back(CB_OUT, 1)?;
        c.tile_regs_wait()?;
        c.pack_tile(0, CB_OUT)?;
        c.tile_regs_release()?;
        c.cb_push_back(CB_OUT, 1)
    });
    let writer = kernels.register(|api| {
        let df = api.dataflow()?;
        let id = df.get_arg_uint32(0)?;
        df.cb_wait_front(CB_OUT, 1)?;
        let src = df.get_read_ptr(CB_OUT)?;
        df.noc_async_write_tile(id, BankKind::Dram, C_BASE, TILE_BYTES, DataFormat::Float16B, src)?;
        df.noc_async_write_barrier()?;
        df.cb_pop_front(CB_OUT, 1)
    });

    for id in 0..num_tiles {
        write_dram_tile(machine, num_banks, A_BASE, id, &ramp(id, 1.0))?;
        write_dram_tile(machine, num_banks, B_BASE, id, &ramp(id, -0.5))?;

        let tile = &machine.tiles()[id as usize];
        let l1 = tile.get_l1();
        let cfg = KernelConfig::at(CONFIG_BASE);
        cfg.write(l1.as_ref())?;
        for (n, cb) in [CB_IN0, CB_IN1, CB_OUT].into_iter().enumerate() {
            let addr = CB_BASE + n as u32 * 2 * TILE_BYTES;
            cfg.write_cb(l1.as_ref(), cb, CbConfig::from_bytes(addr, 2, TILE_BYTES))?;
        }
        for kind in [RiscKind::Brisc, RiscKind::Ncrisc] {
            cfg.write_args(l1.as_ref(), kind, &[id])?;
        }
        tile.load_kernel(RiscKind::Ncrisc, reader)?;
        tile.load_kernel(RiscKind::Trisc, compute)?;
        tile.load_kernel(RiscKind::Brisc, writer)?;
    }

    machine.launch_kernels()?;
    let busy = machine.busy_threads();
    if !busy.is_empty() {
        bail!("kernels did not finish: {:?}", busy);
    }

    for id in 0..num_tiles {
        let out = read_dram_tile(machine, num_banks, C_BASE, id)?;
        let expected: Vec<f32> = ramp(id, 1.0).iter().zip(ramp(id, -0.5)).map(|(a, b)| a + b).collect();
        let tile = &machine.tiles()[id as usize];
        if out != expected {
            let bad = out.iter().zip(&expected).position(|(a, b)| a != b).unwrap_or(0);
            bail!(
                "tile {:?}: element {} is {}, expected {}",
                tile.logical_xy(),
                bad,
                out[bad],
                expected[bad]
            );
        }
        println!("tile {:?} at {:?}: eltwise add ok", tile.logical_xy(), tile.my_xy());
    }
    Ok(())
}

/// Small values exactly representable in Float16_b.
fn ramp(id: u32, scale: f32) -> Vec<f32> {
    (0..TILE_SIZE).map(|i| ((i % 32) as f32 + id as f32) * scale).collect()
}

fn write_dram_tile(machine: &Machine, num_banks: u32, base: u32, id: u32, tile: &[f32]) -> anyhow::Result<()> {
    let mut faces = vec![0.0; TILE_SIZE];
    tile_to_faces(tile, &mut faces);
    let bytes = pack_tile(DataFormat::Float16B, &faces)?;
    let bank = machine.soc().dram(id % num_banks)?;
    bank.write(base + (id / num_banks) * TILE_BYTES, &bytes)?;
    Ok(())
}

fn read_dram_tile(machine: &Machine, num_banks: u32, base: u32, id: u32) -> anyhow::Result<Vec<f32>> {
    let mut bytes = vec![0u8; TILE_BYTES as usize];
    machine.soc().dram(id % num_banks)?.read(base + (id / num_banks) * TILE_BYTES, &mut bytes)?;
    let mut faces = vec![0.0; TILE_SIZE];
    unpack_tile(DataFormat::Float16B, &bytes, &mut faces)?;
    let mut tile = vec![0.0; TILE_SIZE];
    faces_to_tile(&faces, &mut tile);
    Ok(tile)
}
