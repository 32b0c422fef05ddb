#[cfg(test)]
mod helpers;

#[cfg(test)]
mod basic_operations;
#[cfg(test)]
mod data_types;
#[cfg(test)]
mod persistence;
#[cfg(test)]
mod replication;
